//! Identity types for IPAACA
//!
//! Unit uids are random UUIDs. Buffers get a unique name derived from the
//! owning component plus a short random suffix; the short form doubles as the
//! buffer's hidden category for resend traffic.

use std::fmt;

use uuid::Uuid;

/// Scope prefix for category channels
pub const CHANNEL_SCOPE_PREFIX: &str = "/ipaaca/channel/";

/// Scope prefix for component (buffer) endpoints
pub const COMPONENT_SCOPE_PREFIX: &str = "/ipaaca/component/";

/// Generate a fresh, globally unique IU identifier
pub fn generate_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Which side of the protocol a buffer implements
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Output,
    Input,
}

impl BufferRole {
    #[inline]
    pub fn suffix(self) -> &'static str {
        match self {
            BufferRole::Output => "OB",
            BufferRole::Input => "IB",
        }
    }
}

/// Unique buffer name: `/ipaaca/component/<component>ID<8 hex>/<OB|IB>`
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BufferName {
    short: String,
    full: String,
}

impl BufferName {
    /// Allocate a new unique name for a buffer of the given component
    pub fn allocate(component: &str, role: BufferRole) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        let short = format!("{}ID{}", component, &suffix[..8]);
        let full = format!("{}{}/{}", COMPONENT_SCOPE_PREFIX, short, role.suffix());
        BufferName { short, full }
    }

    /// Short name, also used as the hidden category of this buffer
    #[inline]
    pub fn short(&self) -> &str {
        &self.short
    }

    /// Full unique name, used as writer name and RPC endpoint
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Debug for BufferName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({})", self.full)
    }
}

impl fmt::Display for BufferName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Transport channel carrying all events of one category
pub fn category_channel(channel: &str, category: &str) -> String {
    format!("{}{}/category/{}", CHANNEL_SCOPE_PREFIX, channel, category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uids_are_unique() {
        let a = generate_uid();
        let b = generate_uid();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_buffer_name_layout() {
        let name = BufferName::allocate("speech", BufferRole::Output);
        assert!(name.short().starts_with("speechID"));
        assert_eq!(name.short().len(), "speechID".len() + 8);
        assert_eq!(
            name.as_str(),
            format!("/ipaaca/component/{}/OB", name.short())
        );

        let other = BufferName::allocate("speech", BufferRole::Output);
        assert_ne!(name, other);
    }

    #[test]
    fn test_category_channel() {
        assert_eq!(
            category_channel("default", "asr"),
            "/ipaaca/channel/default/category/asr"
        );
    }
}
