//! Built-in actions.

mod hypridle;
mod player;
mod updates;

pub use hypridle::GetHypridleStatus;
pub use player::OnMpdChange;
pub use updates::OnCheckUpdates;

use std::sync::Arc;

use crate::error::Result;
use crate::handler::ActionHandler;
use crate::registry::RegistryBuilder;

/// Register every built-in action.
///
/// # Errors
///
/// Fails if an identifier is already taken in `builder`.
pub fn register_builtin(builder: &mut RegistryBuilder) -> Result<()> {
    builder
        .one_shot("get_hypridle_status", |_| {
            Ok(Arc::new(GetHypridleStatus::new()) as Arc<dyn ActionHandler>)
        })?
        .one_shot("on_check_updates", |_| {
            Ok(Arc::new(OnCheckUpdates::new()) as Arc<dyn ActionHandler>)
        })?
        .long_running("on_mpd_change", |args| {
            Ok(Arc::new(OnMpdChange::from_args(args)?) as Arc<dyn ActionHandler>)
        })?;
    Ok(())
}

/// Whether `name` resolves to an executable on `PATH`.
pub(crate) fn is_installed(name: &str) -> bool {
    which::which(name).is_ok()
}
