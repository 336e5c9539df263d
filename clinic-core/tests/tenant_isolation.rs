use std::sync::Arc;

use clinic_core::{
    approve_correction, request_correction, AuditLogger, AuditSink, ClinicError,
    CrossTenantPolicy, DeclaredRole, ErrorKind, MemoryStore, OrganizationId, Principal,
    ScopedAccessor, TenantGuard, TenantOwned,
};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Patient {
    id: String,
    organization_id: OrganizationId,
    name: String,
    #[serde(default)]
    phone: Option<String>,
}

impl TenantOwned for Patient {
    const TABLE: &'static str = "patients";

    fn id(&self) -> &str {
        &self.id
    }

    fn organization_id(&self) -> &OrganizationId {
        &self.organization_id
    }

    fn set_organization_id(&mut self, organization_id: OrganizationId) {
        self.organization_id = organization_id;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ClinicalNote {
    id: String,
    organization_id: OrganizationId,
    body: String,
    status: String,
}

impl TenantOwned for ClinicalNote {
    const TABLE: &'static str = "clinical_notes";

    fn id(&self) -> &str {
        &self.id
    }

    fn organization_id(&self) -> &OrganizationId {
        &self.organization_id
    }

    fn set_organization_id(&mut self, organization_id: OrganizationId) {
        self.organization_id = organization_id;
    }

    fn lock_status(&self) -> Option<&str> {
        Some(&self.status)
    }
}

fn principal(org: &str) -> Principal {
    Principal::new("u-1", Some(org.into()), DeclaredRole::Unspecified)
}

fn patient(id: &str, org: &str, name: &str) -> Patient {
    Patient {
        id: id.to_string(),
        organization_id: org.into(),
        name: name.to_string(),
        phone: None,
    }
}

async fn two_clinics() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            "patients",
            [
                json!({"id": "1", "organization_id": "org-1", "name": "Ada"}),
                json!({"id": "2", "organization_id": "org-1", "name": "Grace"}),
                json!({"id": "42", "organization_id": "org-2", "name": "Linus"}),
            ],
        )
        .await;
    store
}

#[tokio::test]
async fn reads_only_see_the_callers_organization() {
    let store = two_clinics().await;
    let scoped = ScopedAccessor::new(Arc::clone(&store), &principal("org-1")).unwrap();

    let all = scoped.select::<Patient>().all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|p| p.organization_id.as_str() == "org-1"));

    let by_name = scoped
        .select::<Patient>()
        .filter("name", "Linus")
        .all()
        .await
        .unwrap();
    assert!(by_name.is_empty());
}

#[tokio::test]
async fn cross_tenant_read_is_not_found() {
    let store = two_clinics().await;
    let p = principal("org-1");
    let scoped = ScopedAccessor::new(Arc::clone(&store), &p).unwrap();

    let err = scoped.select::<Patient>().by_id("42").one().await.unwrap_err();
    assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::NotFound));

    let err = TenantGuard::default()
        .verify_principal_owns(store.as_ref(), &p, "42", "patients")
        .await
        .unwrap_err();
    assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::NotFound));

    let err = TenantGuard::new(CrossTenantPolicy::Forbidden)
        .verify_principal_owns(store.as_ref(), &p, "42", "patients")
        .await
        .unwrap_err();
    assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::Forbidden));

    let err = TenantGuard::new(CrossTenantPolicy::Forbidden)
        .verify_principal_owns(store.as_ref(), &p, "404", "patients")
        .await
        .unwrap_err();
    assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::NotFound));
}

#[tokio::test]
async fn cross_tenant_update_and_delete_touch_nothing() {
    let store = two_clinics().await;
    let scoped = ScopedAccessor::new(Arc::clone(&store), &principal("org-1")).unwrap();

    let updated = scoped
        .update::<Patient>()
        .by_id("42")
        .set(json!({"name": "Mallory"}))
        .await
        .unwrap();
    assert!(updated.is_empty());

    let removed = scoped.delete::<Patient>().by_id("42").execute().await.unwrap();
    assert!(removed.is_empty());

    let rows = store.dump("patients").await;
    let linus = rows.iter().find(|r| r["id"] == json!("42")).unwrap();
    assert_eq!(linus["name"], json!("Linus"));
    assert_eq!(linus["organization_id"], json!("org-2"));
}

#[tokio::test]
async fn update_cannot_move_a_row_or_change_its_id() {
    let store = two_clinics().await;
    let scoped = ScopedAccessor::new(Arc::clone(&store), &principal("org-1")).unwrap();

    let updated = scoped
        .update::<Patient>()
        .by_id("1")
        .set(json!({"id": "99", "organization_id": "org-2", "name": "Ada L."}))
        .await
        .unwrap();
    assert_eq!(updated, vec![patient("1", "org-1", "Ada L.")]);
}

#[tokio::test]
async fn ill_typed_patch_leaves_the_row_untouched() {
    let store = two_clinics().await;
    let scoped = ScopedAccessor::new(Arc::clone(&store), &principal("org-1")).unwrap();

    let err = scoped
        .update::<Patient>()
        .by_id("1")
        .set(json!({"name": 5}))
        .await
        .unwrap_err();
    assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::BadRequest));

    let row = scoped.select::<Patient>().by_id("1").one().await.unwrap();
    assert_eq!(row, patient("1", "org-1", "Ada"));
    assert_eq!(scoped.select::<Patient>().all().await.unwrap().len(), 2);

    let mut tx = scoped.begin().await.unwrap();
    assert!(tx.update::<Patient>().by_id("1").set(json!({"name": 5})).await.is_err());
    tx.commit().await.unwrap();
    assert_eq!(store.dump("patients").await[0]["name"], json!("Ada"));
}

#[tokio::test]
async fn accessor_requires_an_active_tenant() {
    let store = Arc::new(MemoryStore::new());
    let nobody = Principal::new("u-1", None, DeclaredRole::Unspecified);
    let err = ScopedAccessor::new(store, &nobody).err().unwrap();
    assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::NoActiveTenant));
}

#[tokio::test]
async fn locked_notes_reject_update_and_delete() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            "clinical_notes",
            [
                json!({"id": "n-1", "organization_id": "org-1", "body": "extraction", "status": "signed"}),
                json!({"id": "n-2", "organization_id": "org-1", "body": "draft", "status": "draft"}),
            ],
        )
        .await;
    let scoped = ScopedAccessor::new(Arc::clone(&store), &principal("org-1")).unwrap();

    let err = scoped
        .update::<ClinicalNote>()
        .by_id("n-1")
        .set(json!({"body": "edited"}))
        .await
        .unwrap_err();
    let clinic = ClinicError::from_anyhow(&err).unwrap();
    assert_eq!(clinic.kind, ErrorKind::Locked);
    assert!(clinic.message.contains("addendum"));

    let err = scoped.delete::<ClinicalNote>().by_id("n-1").execute().await.unwrap_err();
    assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::Locked));

    // A bulk update touching a signed note applies to none of the rows.
    let err = scoped
        .update::<ClinicalNote>()
        .set(json!({"body": "bulk"}))
        .await
        .unwrap_err();
    assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::Locked));

    let notes = scoped.select::<ClinicalNote>().all().await.unwrap();
    assert_eq!(notes[0].body, "extraction");
    assert_eq!(notes[1].body, "draft");

    scoped
        .update::<ClinicalNote>()
        .by_id("n-2")
        .set(json!({"body": "final"}))
        .await
        .unwrap();
}

#[tokio::test]
async fn dropped_transaction_rolls_back() {
    let store = two_clinics().await;
    let scoped = ScopedAccessor::new(Arc::clone(&store), &principal("org-1")).unwrap();

    {
        let mut tx = scoped.begin().await.unwrap();
        tx.insert::<Patient>()
            .value(patient("3", "org-1", "Barbara"))
            .await
            .unwrap();
        tx.delete::<Patient>().by_id("1").execute().await.unwrap();
    }
    assert_eq!(scoped.select::<Patient>().all().await.unwrap().len(), 2);

    let mut tx = scoped.begin().await.unwrap();
    tx.insert::<Patient>()
        .value(patient("3", "org-1", "Barbara"))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(scoped.select::<Patient>().all().await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_apply_exactly_once() {
    let store = two_clinics().await;
    let scoped = ScopedAccessor::new(Arc::clone(&store), &principal("org-1")).unwrap();
    let audit = AuditLogger::new(Arc::clone(&store));
    let request = request_correction::<_, Patient>(&scoped, "1", json!({"phone": "555-0101"}))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let (scoped, audit, id) = (scoped.clone(), audit.clone(), request.id.clone());
        handles.push(tokio::spawn(async move {
            approve_correction::<_, Patient, _>(&scoped, &audit, &id).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => {
                assert_eq!(ClinicError::kind_of(&e), Some(ErrorKind::Conflict));
                conflicts += 1;
            }
        }
    }
    assert_eq!((ok, conflicts), (1, 1));
    assert_eq!(store.audit_entries(&"org-1".into()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn audit_outage_does_not_fail_the_approval() {
    let store = two_clinics().await;
    store.fail_audit_writes(true);
    let scoped = ScopedAccessor::new(Arc::clone(&store), &principal("org-1")).unwrap();
    let audit = AuditLogger::new(Arc::clone(&store));

    let request = request_correction::<_, Patient>(&scoped, "2", json!({"phone": "555-0102"}))
        .await
        .unwrap();
    approve_correction::<_, Patient, _>(&scoped, &audit, &request.id)
        .await
        .unwrap();

    let grace = scoped.select::<Patient>().by_id("2").one().await.unwrap();
    assert_eq!(grace.phone.as_deref(), Some("555-0102"));
    assert!(store.audit_entries(&"org-1".into()).await.unwrap().is_empty());
}

fn org_id() -> impl Strategy<Value = String> {
    prop_oneof![Just("org-1".to_string()), Just("org-2".to_string()), "[a-z0-9]{1,6}"]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn inserted_rows_carry_the_callers_org(claimed in proptest::collection::vec(org_id(), 1..8)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let scoped = ScopedAccessor::new(Arc::clone(&store), &principal("org-1")).unwrap();
            let rows: Vec<Patient> = claimed
                .iter()
                .enumerate()
                .map(|(i, org)| patient(&format!("p-{i}"), org, "x"))
                .collect();

            let inserted = scoped.insert::<Patient>().values(rows).await.unwrap();
            assert!(inserted.iter().all(|p| p.organization_id.as_str() == "org-1"));
            for raw in store.dump("patients").await {
                assert_eq!(raw["organization_id"], json!("org-1"));
            }
        });
    }

    #[test]
    fn selects_never_leak_foreign_rows(owners in proptest::collection::vec(org_id(), 0..12)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            store
                .seed(
                    "patients",
                    owners
                        .iter()
                        .enumerate()
                        .map(|(i, org)| json!({"id": i.to_string(), "organization_id": org, "name": "x"})),
                )
                .await;
            let scoped = ScopedAccessor::new(Arc::clone(&store), &principal("org-1")).unwrap();
            let seen = scoped.select::<Patient>().all().await.unwrap();
            let expected = owners.iter().filter(|o| o.as_str() == "org-1").count();
            assert_eq!(seen.len(), expected);
            assert!(seen.iter().all(|p| p.organization_id.as_str() == "org-1"));
        });
    }
}
