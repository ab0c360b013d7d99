use crate::{
    error::StoreError,
    store::{keys, Store},
};

/// Server filename that stands for "nothing to show yet".
pub const EMPTY_STATE: &str = "empty_state";

/// Whether `identity` differs from what the panel shows. Read-only.
///
/// The placeholder compares against the `registered` flag instead of the
/// filename: it renders only while the flag is set, and committing it clears
/// the flag, so it is never drawn twice in a row.
pub fn should_render(store: &dyn Store, identity: &str) -> Result<bool, StoreError> {
    let registered = store.bool_or(keys::REGISTERED, true)?;
    if identity == EMPTY_STATE {
        return Ok(registered);
    }
    if !registered {
        return Ok(true);
    }
    Ok(store.get_str(keys::FILENAME)?.as_deref() != Some(identity))
}

/// Records a successful render.
pub fn commit(store: &mut dyn Store, identity: &str) -> Result<(), StoreError> {
    if identity == EMPTY_STATE {
        store.set_bool_if_changed(keys::REGISTERED, false)?;
        return Ok(());
    }
    store.set_bool_if_changed(keys::REGISTERED, true)?;
    store.set_str_if_changed(keys::FILENAME, identity)?;
    Ok(())
}

/// Forgets what is on the panel so the next poll redraws either kind of content.
pub fn invalidate(store: &mut dyn Store) -> Result<(), StoreError> {
    store.set_bool_if_changed(keys::REGISTERED, true)?;
    store.set_str_if_changed(keys::FILENAME, "")?;
    Ok(())
}

pub fn last_identity(store: &dyn Store) -> Result<String, StoreError> {
    store.str_or(keys::FILENAME, "")
}
