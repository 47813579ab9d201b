//! Error → exit-code mapping.
//!
//! Codes: 0 success, 1 generic, 2 input/config, 3 store-not-found,
//! 5 source/network, 7 store IO/index, 8 filter compile/eval.

use skygent_core::errors::{ExitCode, IdError};
use skygent_filter::{FilterCompileError, FilterEvalError};
use skygent_identity::IdentityError;
use skygent_images::ImageError;
use skygent_settings::loader::SettingsError;
use skygent_store::StoreError;
use skygent_sync::{DerivationError, SourceError, SyncError, SyncStage};

/// Map an error chain to the process exit code.
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    let code = if let Some(e) = error.downcast_ref::<StoreError>() {
        store_code(e)
    } else if error.downcast_ref::<FilterCompileError>().is_some()
        || error.downcast_ref::<FilterEvalError>().is_some()
    {
        ExitCode::Filter
    } else if let Some(e) = error.downcast_ref::<SyncError>() {
        match e.stage() {
            SyncStage::Source => ExitCode::Source,
            SyncStage::Filter => ExitCode::Filter,
            SyncStage::Store => ExitCode::StoreIo,
        }
    } else if let Some(e) = error.downcast_ref::<DerivationError>() {
        match e {
            DerivationError::Compile(_) | DerivationError::Eval(_) => ExitCode::Filter,
            DerivationError::Store(inner) => store_code(inner),
            DerivationError::SameStore
            | DerivationError::EffectfulFilter
            | DerivationError::SettingsChanged { .. } => ExitCode::Generic,
        }
    } else if error.downcast_ref::<SourceError>().is_some() {
        ExitCode::Source
    } else if error.downcast_ref::<IdentityError>().is_some() {
        ExitCode::Source
    } else if let Some(e) = error.downcast_ref::<ImageError>() {
        match e {
            ImageError::Disabled => ExitCode::Input,
            ImageError::Fetch { .. } | ImageError::NegativeCached { .. } => ExitCode::Source,
            _ => ExitCode::StoreIo,
        }
    } else if error.downcast_ref::<IdError>().is_some()
        || error.downcast_ref::<SettingsError>().is_some()
        || error.downcast_ref::<serde_json::Error>().is_some()
    {
        ExitCode::Input
    } else if error.downcast_ref::<std::io::Error>().is_some() {
        ExitCode::StoreIo
    } else {
        ExitCode::Generic
    };
    code.code()
}

fn store_code(error: &StoreError) -> ExitCode {
    match error {
        StoreError::NotFound(_) => ExitCode::StoreNotFound,
        StoreError::AlreadyExists(_) | StoreError::Corrupt(_) => ExitCode::Input,
        _ => ExitCode::StoreIo,
    }
}
