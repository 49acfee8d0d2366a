pub mod control;
pub mod listeners;
pub mod paths;
pub mod reconcile;
pub mod snapshot;
pub mod workspace;

pub use control::{ClientMessage, ControlError, ControlMessage, FileEventKind};
pub use listeners::{Listeners, Subscription};
pub use reconcile::{PendingReview, ReconcileOutcome, Reconciler, Rejection, ReviewResolution};
pub use snapshot::SnapshotStore;
pub use workspace::{RootChange, WorkspaceError, WorkspaceRegistry, WorkspaceState, MAX_RECENT};

/// Session ids are assigned monotonically by the hub and never reused.
pub type SessionId = u32;
