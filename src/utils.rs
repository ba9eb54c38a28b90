pub mod drm_scanner;
