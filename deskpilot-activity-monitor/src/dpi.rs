//! Display density, used to turn a physical pointer distance into pixels.

use tracing::{debug, warn};

pub const DEFAULT_DPI: f64 = 96.0;
const CM_PER_INCH: f64 = 2.54;

/// DPI of the primary monitor (`scale_factor * 96`), or 96 when it cannot
/// be determined.
pub fn detect_dpi() -> f64 {
    let monitors = match xcap::Monitor::all() {
        Ok(monitors) => monitors,
        Err(e) => {
            warn!("Failed to enumerate monitors, assuming {DEFAULT_DPI} DPI: {e}");
            return DEFAULT_DPI;
        }
    };
    for monitor in monitors {
        match monitor.is_primary() {
            Ok(true) => {
                return match monitor.scale_factor() {
                    Ok(scale) if scale > 0.0 => {
                        let dpi = f64::from(scale) * DEFAULT_DPI;
                        debug!(dpi, "Detected primary monitor DPI");
                        dpi
                    }
                    Ok(_) => DEFAULT_DPI,
                    Err(e) => {
                        warn!("Failed to read monitor scale factor: {e}");
                        DEFAULT_DPI
                    }
                };
            }
            Ok(false) => continue,
            Err(e) => {
                warn!("Error checking monitor primary status: {e}");
                continue;
            }
        }
    }
    DEFAULT_DPI
}

/// Configured override when positive, otherwise the detected value.
pub fn resolve_dpi(configured: Option<f64>) -> f64 {
    match configured {
        Some(dpi) if dpi > 0.0 => dpi,
        _ => detect_dpi(),
    }
}

/// Pixel threshold for `cm` of travel; never below one pixel.
pub fn cm_to_px(cm: f64, dpi: f64) -> f64 {
    (cm * dpi / CM_PER_INCH).max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cm_to_px() {
        assert!((cm_to_px(2.54, 96.0) - 96.0).abs() < 1e-9);
        assert!((cm_to_px(4.0, 144.0) - 226.771_653).abs() < 1e-3);
        assert_eq!(cm_to_px(0.0, 96.0), 1.0);
        assert_eq!(cm_to_px(-3.0, 96.0), 1.0);
    }

    #[test]
    fn test_override_wins() {
        assert_eq!(resolve_dpi(Some(120.0)), 120.0);
    }
}
