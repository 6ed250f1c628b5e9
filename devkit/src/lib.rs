/*!
# Pioreactor DevKit - stubs and helpers for testing sync contexts

- `MockBus`: in-memory bus session, records publishes and injects inbound messages
- `FakeBackend`: scripted leader REST responses, with optional delays and failures
- `TestHarness`: a running `SyncContext` wired to both, plus wait/assert helpers
*/

pub mod fake_backend;
pub mod mqtt_stub;
pub mod test_utils;

pub use fake_backend::FakeBackend;
pub use mqtt_stub::{MockBus, MockMessage};
pub use test_utils::TestHarness;
