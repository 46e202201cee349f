//! Streaming cache configuration.
//!
//! All tunables live in one explicit struct handed to the manager at
//! construction. There is no process-wide state; two caches with different
//! configs can coexist in one process.

use serde::{Deserialize, Serialize};

use crate::error::{StreamingError, StreamingResult};
use crate::gpu::layout::MAX_CHILD_REF_PAGE;

/// Configuration for a [`crate::manager::StreamingManager`].
///
/// Loadable from TOML; missing fields fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Initial streaming pool capacity in page slots
    pub initial_pool_pages: u32,

    /// Lower clamp for the pool size manager
    pub min_pool_pages: u32,

    /// Upper clamp for the pool size manager
    pub max_pool_pages: u32,

    /// Byte size of one streaming page slot
    pub page_byte_size: u32,

    /// Capacity of the always-resident root page pool, in pages
    pub max_root_pages: u32,

    /// Byte size of one root page slot
    pub root_page_byte_size: u32,

    /// Capacity of the shared hierarchy buffer, in nodes
    pub max_hierarchy_nodes: u32,

    /// Size of the virtual page index space shared by all resources
    pub max_virtual_pages: u32,

    /// Maximum number of in-flight fetches
    pub max_pending_pages: u32,

    /// Maximum page installs per update cycle
    pub max_page_installs_per_update: u32,

    /// Install bandwidth budget in staged payload bytes (chunk metadata plus
    /// page data) per cycle; 0 disables the throttle
    pub install_budget_bytes: u64,

    /// Total fetch attempts per page before its resource is marked invalid
    pub retry_limit: u32,

    /// Capacity of the staging ring in bytes; 0 derives it from
    /// `max_pending_pages * page_byte_size`
    pub ring_capacity_bytes: u32,

    /// Number of leading streaming pages requested by `prefetch_resource`
    pub prefetch_page_count: u32,

    /// Pool growth headroom applied to observed demand
    pub pool_grow_headroom: f32,

    /// Consecutive over-budget cycles before the pool grows
    pub pool_grow_debounce_cycles: u32,

    /// Fraction of the pool target decayed per shrink cycle
    pub pool_shrink_decay: f32,

    /// Consecutive under-budget cycles before the pool starts shrinking
    pub pool_shrink_debounce_cycles: u32,

    /// Run the update cycle on a worker thread instead of inline
    pub async_update: bool,

    /// Run the consistency verification pass after every cycle
    pub enable_verification: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            initial_pool_pages: 256,
            min_pool_pages: 64,
            max_pool_pages: 2048,
            page_byte_size: 128 * 1024,
            max_root_pages: 1024,
            root_page_byte_size: 64 * 1024,
            max_hierarchy_nodes: 64 * 1024,
            max_virtual_pages: 1 << 20,
            max_pending_pages: 128,
            max_page_installs_per_update: 128,
            install_budget_bytes: 0,
            retry_limit: 3,
            ring_capacity_bytes: 0,
            prefetch_page_count: 8,
            pool_grow_headroom: 1.25,
            pool_grow_debounce_cycles: 2,
            pool_shrink_decay: 0.02,
            pool_shrink_debounce_cycles: 30,
            async_update: true,
            enable_verification: cfg!(debug_assertions),
        }
    }
}

impl StreamingConfig {
    /// Parse a config from TOML text
    pub fn from_toml_str(text: &str) -> StreamingResult<Self> {
        let config: StreamingConfig =
            toml::from_str(text).map_err(|e| StreamingError::InvalidConfig {
                message: format!("toml parse failed: {}", e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a TOML file
    pub fn from_toml_file(path: &std::path::Path) -> StreamingResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StreamingError::Io {
            message: format!("reading {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&text)
    }

    /// Effective staging ring capacity in bytes.
    ///
    /// Saturates on overflow; [`StreamingConfig::validate`] rejects configs
    /// whose derived capacity does not fit in a `u32`.
    pub fn ring_capacity(&self) -> u32 {
        if self.ring_capacity_bytes != 0 {
            self.ring_capacity_bytes
        } else {
            self.max_pending_pages.saturating_mul(self.page_byte_size)
        }
    }

    /// Reject inconsistent settings before any state is built
    pub fn validate(&self) -> StreamingResult<()> {
        let fail = |message: String| Err(StreamingError::InvalidConfig { message });

        if self.min_pool_pages == 0 || self.max_pool_pages < self.min_pool_pages {
            return fail(format!(
                "pool page clamp [{}, {}] is empty",
                self.min_pool_pages, self.max_pool_pages
            ));
        }
        if self.initial_pool_pages < self.min_pool_pages
            || self.initial_pool_pages > self.max_pool_pages
        {
            return fail(format!(
                "initial_pool_pages {} outside clamp [{}, {}]",
                self.initial_pool_pages, self.min_pool_pages, self.max_pool_pages
            ));
        }
        if self.page_byte_size == 0 || self.page_byte_size % 4 != 0 {
            return fail(format!(
                "page_byte_size {} must be a positive multiple of 4",
                self.page_byte_size
            ));
        }
        if self.root_page_byte_size == 0 || self.root_page_byte_size % 4 != 0 {
            return fail(format!(
                "root_page_byte_size {} must be a positive multiple of 4",
                self.root_page_byte_size
            ));
        }
        if self.max_root_pages == 0 {
            return fail("max_root_pages must be nonzero".to_string());
        }
        // Pool slots and root locations are packed into child references.
        if self.max_pool_pages > MAX_CHILD_REF_PAGE || self.max_root_pages > MAX_CHILD_REF_PAGE {
            return fail(format!(
                "pool of {} pages / {} root pages exceeds the {} addressable by a child reference",
                self.max_pool_pages, self.max_root_pages, MAX_CHILD_REF_PAGE
            ));
        }
        if self.max_hierarchy_nodes == 0 {
            return fail("max_hierarchy_nodes must be nonzero".to_string());
        }
        if self.max_virtual_pages == 0 {
            return fail("max_virtual_pages must be nonzero".to_string());
        }
        if self.max_pending_pages == 0 {
            return fail("max_pending_pages must be nonzero".to_string());
        }
        if self.max_page_installs_per_update == 0 {
            return fail("max_page_installs_per_update must be nonzero".to_string());
        }
        if self.retry_limit == 0 {
            return fail("retry_limit must be at least 1".to_string());
        }
        if self.ring_capacity_bytes == 0
            && self
                .max_pending_pages
                .checked_mul(self.page_byte_size)
                .is_none()
        {
            return fail(format!(
                "derived ring capacity {} pages x {} bytes overflows u32",
                self.max_pending_pages, self.page_byte_size
            ));
        }
        // The ring reserves one sentinel byte, so the largest page must still fit.
        if self.ring_capacity() <= self.page_byte_size {
            return fail(format!(
                "ring capacity {} cannot stage a {}-byte page",
                self.ring_capacity(),
                self.page_byte_size
            ));
        }
        if self.pool_grow_headroom < 1.0 {
            return fail(format!(
                "pool_grow_headroom {} must be at least 1.0",
                self.pool_grow_headroom
            ));
        }
        if !(self.pool_shrink_decay > 0.0 && self.pool_shrink_decay < 1.0) {
            return fail(format!(
                "pool_shrink_decay {} must be in (0, 1)",
                self.pool_shrink_decay
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(StreamingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_ring_capacity_derived_from_pending_budget() {
        let config = StreamingConfig::default();
        assert_eq!(
            config.ring_capacity(),
            config.max_pending_pages * config.page_byte_size
        );

        let explicit = StreamingConfig {
            ring_capacity_bytes: 1 << 20,
            ..StreamingConfig::default()
        };
        assert_eq!(explicit.ring_capacity(), 1 << 20);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = StreamingConfig::from_toml_str(
            r#"
            initial_pool_pages = 128
            max_pending_pages = 32
            retry_limit = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.initial_pool_pages, 128);
        assert_eq!(config.max_pending_pages, 32);
        assert_eq!(config.retry_limit, 5);
        assert_eq!(config.page_byte_size, StreamingConfig::default().page_byte_size);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = StreamingConfig::default();
        config.initial_pool_pages = config.max_pool_pages + 1;
        assert!(config.validate().is_err());

        let mut config = StreamingConfig::default();
        config.page_byte_size = 6;
        assert!(config.validate().is_err());

        let mut config = StreamingConfig::default();
        config.retry_limit = 0;
        assert!(config.validate().is_err());

        let mut config = StreamingConfig::default();
        config.ring_capacity_bytes = config.page_byte_size;
        assert!(config.validate().is_err());

        let mut config = StreamingConfig::default();
        config.max_pool_pages = MAX_CHILD_REF_PAGE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_derived_ring_rejected() {
        let config = StreamingConfig {
            max_pending_pages: 1 << 16,
            page_byte_size: 1 << 16,
            ring_capacity_bytes: 0,
            ..StreamingConfig::default()
        };
        // Must reject, not panic on the multiply or wrap to a smaller ring.
        assert!(config.validate().is_err());
        assert_eq!(config.ring_capacity(), u32::MAX);
    }
}
