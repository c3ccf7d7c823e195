//! Per-tenant, segment-structured write-ahead log.

pub mod error;
pub mod record;
pub mod segment;
pub mod watcher;
pub mod writer;

pub use error::{WalError, WalResult};
pub use record::Record;
pub use segment::{list_segments, read_segment, SegmentInfo};
pub use watcher::{Stoppable, WalConsumer, WalWatcher};
pub use writer::Wal;

/// Directory name used for entries without a tenant.
pub const DEFAULT_TENANT_DIR: &str = "@default";

/// Removes finished segments from a WAL directory.
pub trait SegmentDeleter: Send + Sync {
    fn delete_segment(&self, index: u32) -> WalResult<()>;
}

/// Directory name holding `tenant`'s WAL, or `None` when the tenant cannot be
/// mapped to a single path component that maps back to it.
pub fn tenant_dir_name(tenant: &str) -> Option<String> {
    if tenant.is_empty() {
        return Some(DEFAULT_TENANT_DIR.to_string());
    }
    if tenant == "."
        || tenant == ".."
        || tenant == DEFAULT_TENANT_DIR
        || tenant.contains('/')
        || tenant.contains('\\')
    {
        return None;
    }
    Some(tenant.to_string())
}

/// Inverse of [`tenant_dir_name`].
pub fn tenant_from_dir_name(name: &str) -> String {
    if name == DEFAULT_TENANT_DIR {
        String::new()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_dir_name() {
        assert_eq!(tenant_dir_name("").as_deref(), Some("@default"));
        assert_eq!(tenant_dir_name("team-a").as_deref(), Some("team-a"));
        assert_eq!(tenant_dir_name("."), None);
        assert_eq!(tenant_dir_name(".."), None);
        assert_eq!(tenant_dir_name("a/b"), None);
        assert_eq!(tenant_dir_name("a\\b"), None);
        assert_eq!(tenant_dir_name("@default"), None);
    }

    #[test]
    fn test_tenant_dir_name_round_trips() {
        for tenant in ["", "team-a", "@other", "default", "@default-2"] {
            let dir = tenant_dir_name(tenant).unwrap();
            assert_eq!(tenant_from_dir_name(&dir), tenant);
        }
    }

    #[test]
    fn test_tenant_from_dir_name() {
        assert_eq!(tenant_from_dir_name("@default"), "");
        assert_eq!(tenant_from_dir_name("team-a"), "team-a");
    }
}
