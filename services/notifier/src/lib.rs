pub mod api;
pub mod config;
pub mod control_api;
pub mod controller;
pub mod desktop;
pub mod navigation;
pub mod session;
pub mod sse;
pub mod state;
pub mod surface;
pub mod transport;
pub mod ui_events;
pub mod ui_log;

pub use controller::{ControllerHandle, MutationOutcome, NotificationController, Phase};
pub use state::{Mutation, NotificationState, StateOrigin};
pub use transport::{ConnectionState, Identity, ReconnectPolicy, TransportManager};
