/// Shared-store key layout for berth state.
pub mod keys {
    /// Leased host ports, shared by every cooperating control-plane process.
    /// Format: berth:ports
    /// Type: hash, field = port number, value = owner id
    /// TTL: None (entries removed on release)
    pub const PORT_LEASES: &str = "berth:ports";
}

/// Maximum owner-id length accepted as a hash value.
pub const MAX_OWNER_ID_LEN: usize = 128;

/// Validate an owner id before it reaches the shared store.
///
/// Owners are proxy ids; accepted characters are ASCII alphanumerics,
/// `-` and `_`.
///
/// # Errors
///
/// Returns a description of the first violated rule.
pub fn validate_owner_id(owner_id: &str) -> Result<(), &'static str> {
    if owner_id.is_empty() {
        return Err("owner id must not be empty");
    }
    if owner_id.len() > MAX_OWNER_ID_LEN {
        return Err("owner id must be at most 128 characters");
    }
    if !owner_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("owner id may only contain [A-Za-z0-9_-]");
    }
    Ok(())
}
