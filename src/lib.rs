pub mod auth;
pub mod logging;
pub mod market;
pub mod orchestrator;
pub mod patcher;
pub mod providers;
pub mod registry;

pub mod util {
    pub mod env;
}
