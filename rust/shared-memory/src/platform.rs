//! Platform-specific helpers for shared memory

use scratchpad_core::{Result, ScratchpadError};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        /// Longest name `shm_open` accepts (PSHMNAMLEN)
        const MAX_NAME_LEN: usize = 31;
    } else {
        const MAX_NAME_LEN: usize = 255;
    }
}

/// Platform capabilities
pub struct PlatformCapabilities {
    /// Maximum length of a segment name, including the leading slash
    pub max_name_len: usize,
}

impl PlatformCapabilities {
    /// Get platform capabilities
    pub fn get() -> Self {
        Self {
            max_name_len: MAX_NAME_LEN,
        }
    }
}

/// Platform-specific utilities
pub struct PlatformUtils;

impl PlatformUtils {
    /// Generate a unique segment name
    ///
    /// Names stay short enough for the tightest platform limit.
    pub fn generate_segment_name(prefix: &str) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", prefix, &id[..16])
    }

    /// Name handed to `shm_open`, which requires a leading slash
    pub fn os_name(name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{}", name)
        }
    }

    /// Public form of a segment name, without the leading slash
    pub fn public_name(name: &str) -> &str {
        name.trim_start_matches('/')
    }

    /// Check a segment name before handing it to the OS
    pub fn validate_segment_name(name: &str) -> Result<()> {
        let public = Self::public_name(name);
        let max = PlatformCapabilities::get().max_name_len;
        if public.is_empty() || public.len() + 1 > max {
            return Err(ScratchpadError::Value(format!(
                "segment name {:?} must be 1-{} bytes",
                public,
                max - 1
            )));
        }
        if public.contains('/') || public.contains('\0') {
            return Err(ScratchpadError::Value(format!(
                "segment name {:?} contains '/' or a null byte",
                public
            )));
        }
        Ok(())
    }
}
