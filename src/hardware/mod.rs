//! Hardware modules
//!
//! Instrument drivers, the interfaces they implement, and the transport they
//! share:
//!
//! - **`capabilities`**: interface traits logic modules program against
//! - **`transport`**: `InstrumentPort`, resource parsing and port openers
//! - **`retry`**: reconnect-and-retry-once around a port exchange
//! - **`sim`**: in-process device models behind a duplex pipe
//! - **`registry`**: builds drivers from `[[hardware]]` entries
//! - **`mock`**: stand-ins for tests and `--simulate` runs

pub mod capabilities;
pub mod registry;
pub mod retry;
pub mod sim;
pub mod transport;

pub mod aps100;
pub mod awg;
pub mod cobolt;
pub mod lakeshore335;
pub mod lm510;
pub mod mock;
pub mod opus532;
pub mod pi3;
pub mod sg6000pro;
pub mod smbv;
pub mod spm_sim;

pub use registry::{Capability, ModuleRegistry};
pub use transport::{InstrumentPort, PortOpener, PortSettings, Resource};
