use crate::InstallerError;
use stratus_schema::ClusterState;

/// Check a cluster state change against the lifecycle.
///
/// Provisioning moves strictly forward. `failed` is reachable from any
/// state in which a launch can still die, and every state except the
/// deleting ones can be deleted.
pub fn validate_transition(from: ClusterState, to: ClusterState) -> Result<(), InstallerError> {
    use ClusterState::{
        Deleted, Deleting, Failed, Persisted, Provisioning, Ready, Registered, Requested,
        Validating,
    };

    let valid = matches!(
        (from, to),
        (Requested, Validating)
            | (Validating, Persisted)
            | (Persisted, Registered)
            | (Registered, Provisioning)
            | (Provisioning, Ready)
            | (Persisted | Registered | Provisioning, Failed)
            | (Deleting, Deleted)
    ) || (to == Deleting && !from.is_deleting());

    if valid {
        Ok(())
    } else {
        Err(InstallerError::InvalidTransition { from, to })
    }
}
