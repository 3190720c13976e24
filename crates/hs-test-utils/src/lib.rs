// hs-test-utils: Shared test utilities for the notification client.
//
// Provides a mock STOMP broker, a mock notification REST backend, a bare
// STOMP client, and record fixtures for integration testing.

pub mod fixtures;
pub mod mock_backend;
pub mod mock_broker;
pub mod stomp_client;

pub use mock_backend::{FailureMode, MockNotificationBackend};
pub use mock_broker::{ActiveSubscription, MockStompBroker, RefusingEndpoint};
pub use stomp_client::StompTestClient;
