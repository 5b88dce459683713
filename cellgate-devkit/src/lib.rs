/*!
# cellgate devkit

Test support for the edge gateway:
- `MockHubTransport`: in-memory hub that records batches, can be switched to failing
- `ScriptedAdapter`: machine connector replaying a fixed list of events
- `EventBuilder`: fluent construction of `MachineEvent`s
- `TestHarness`: gateway on a temporary storage root wired to the stubs above
*/

pub mod event_builder;
pub mod hub_stub;
pub mod scripted_adapter;
pub mod test_utils;

pub use event_builder::EventBuilder;
pub use hub_stub::MockHubTransport;
pub use scripted_adapter::ScriptedAdapter;
pub use test_utils::{RunningGateway, TestHarness};
