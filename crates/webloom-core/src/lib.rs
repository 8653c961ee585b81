pub mod agent_loop;
pub mod agents;
pub mod config;
pub mod events;
pub mod generate;

pub use agent_loop::*;
pub use agents::*;
pub use config::*;
pub use events::*;
pub use generate::*;
