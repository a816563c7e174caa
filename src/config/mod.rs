pub mod processor;
pub mod settings;

pub use processor::ConfigEditError;
pub use settings::{
    build_env_vars, SbppSettings, ServerVariables, Settings, SettingsError,
};
