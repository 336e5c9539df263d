use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use clinic_core::RequestPermissions;
use tracing::warn;

use crate::extract::Authenticated;
use crate::state::{ClinicBackend, PermissionGate};
use crate::ClinicAxumError;

/// Reject the request unless the caller holds `gate.module:gate.action`.
///
/// ```ignore
/// let app = Router::new()
///     .route(
///         "/notes/{id}/sign",
///         post(sign_note).route_layer(from_fn_with_state(
///             state.gate("clinical", "sign"),
///             require_permission::<PgStore>,
///         )),
///     )
///     .with_state(state);
/// ```
///
/// On success the request carries the [`Authenticated`] caller, the
/// per-request permission memo and the resolved `PermissionSet` as
/// extensions. Stacked gates share the memo, so the role tables are read
/// once per request.
pub async fn require_permission<S: ClinicBackend>(
    State(gate): State<PermissionGate<S>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ClinicAxumError> {
    let existing = req.extensions().get::<Authenticated>().cloned();
    let auth = match existing {
        Some(auth) => auth,
        None => Authenticated::resolve(req.headers(), &gate.state).await?,
    };

    let memo = req
        .extensions()
        .get::<Arc<RequestPermissions<S>>>()
        .cloned()
        .unwrap_or_else(|| Arc::new(gate.state.permissions.for_request(auth.principal.clone())));

    let access = memo.access().await?;
    if let Err(e) = access.require(gate.module, gate.action) {
        warn!(
            user_id = %auth.principal.user_id,
            module = gate.module,
            action = gate.action,
            "route permission denied"
        );
        return Err(e.into());
    }

    let set = access.to_set();
    let extensions = req.extensions_mut();
    extensions.insert(set);
    extensions.insert(Arc::clone(&memo));
    extensions.insert(auth);
    Ok(next.run(req).await)
}
