//! Loader settings.
//!
//! Snapshot of the `loader.dsc.*` keys honored by the controller; values
//! come from the host view's load settings with the documented defaults.

use crate::view::HostView;

/// Settings consulted while loading.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    /// Automatically load the libsystem_c image after the initial load.
    pub auto_load_libsystem: bool,
    /// Allow materializing `__LINKEDIT` segments into the view.
    pub allow_loading_linkedit: bool,
    /// Decode the function-starts stream and queue function analyses.
    pub process_function_starts: bool,
    /// Process CFString literals (consumed by the ObjC collaborator).
    pub process_cfstrings: bool,
    /// Process ObjC metadata (consumed by the ObjC collaborator).
    pub process_objc: bool,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            auto_load_libsystem: true,
            allow_loading_linkedit: false,
            process_function_starts: true,
            process_cfstrings: true,
            process_objc: true,
        }
    }
}

impl LoaderSettings {
    /// Reads the settings from a host view.
    pub fn from_view(view: &dyn HostView) -> Self {
        let defaults = Self::default();
        Self {
            auto_load_libsystem: view
                .setting_bool("loader.dsc.autoLoadLibSystem", defaults.auto_load_libsystem),
            allow_loading_linkedit: view.setting_bool(
                "loader.dsc.allowLoadingLinkeditSegments",
                defaults.allow_loading_linkedit,
            ),
            process_function_starts: view.setting_bool(
                "loader.dsc.processFunctionStarts",
                defaults.process_function_starts,
            ),
            process_cfstrings: view
                .setting_bool("loader.dsc.processCFStrings", defaults.process_cfstrings),
            process_objc: view.setting_bool("loader.dsc.processObjC", defaults.process_objc),
        }
    }
}
