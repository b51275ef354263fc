pub mod gate;
pub mod state;

pub use gate::CooldownGate;
pub use state::CooldownState;
