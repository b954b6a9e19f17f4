use std::{fs, io, path::PathBuf};

use tracing::{debug, info};

use crate::db::models::DeviceName;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("GPIO {pin}: {action} failed: {source}")]
    Gpio {
        pin: u32,
        action: &'static str,
        #[source]
        source: io::Error,
    },
}

/// The two physical outputs driven by the poll loop.
pub trait Outputs {
    fn set(&mut self, device: DeviceName, on: bool) -> Result<(), OutputError>;

    /// Hands the underlying hardware back to the system.
    fn release(&mut self) -> Result<(), OutputError>;
}

// ---------------------------------------------------------------------------
// Sysfs GPIO
// ---------------------------------------------------------------------------

/// Relay outputs through the Linux sysfs GPIO interface
/// (`<root>/export`, `<root>/gpioN/{direction,value}`).
#[derive(Debug)]
pub struct SysfsOutputs {
    root: PathBuf,
    fan_pin: u32,
    heater_pin: u32,
    active_low: bool,
    /// Pins exported by us, unexported again on release.
    exported: Vec<u32>,
}

impl SysfsOutputs {
    /// Exports both pins if needed, configures them as outputs and drives
    /// them off.
    pub fn open(
        root: impl Into<PathBuf>,
        fan_pin: u32,
        heater_pin: u32,
        active_low: bool,
    ) -> Result<Self, OutputError> {
        let mut outputs = Self {
            root: root.into(),
            fan_pin,
            heater_pin,
            active_low,
            exported: Vec::new(),
        };

        for pin in [fan_pin, heater_pin] {
            if !outputs.pin_dir(pin).exists() {
                outputs.write(pin, "export", outputs.root.join("export"), &pin.to_string())?;
                outputs.exported.push(pin);
            }
            outputs.write(pin, "set direction", outputs.pin_dir(pin).join("direction"), "out")?;
            outputs.write_level(pin, false)?;
        }

        info!(
            fan_pin,
            heater_pin,
            active_low,
            root = %outputs.root.display(),
            "GPIO outputs ready"
        );
        Ok(outputs)
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    fn pin(&self, device: DeviceName) -> u32 {
        match device {
            DeviceName::Fan => self.fan_pin,
            DeviceName::Heater => self.heater_pin,
        }
    }

    fn write_level(&self, pin: u32, on: bool) -> Result<(), OutputError> {
        let level = if on != self.active_low { "1" } else { "0" };
        self.write(pin, "set value", self.pin_dir(pin).join("value"), level)
    }

    fn write(&self, pin: u32, action: &'static str, path: PathBuf, contents: &str) -> Result<(), OutputError> {
        debug!(pin, path = %path.display(), contents, "GPIO write");
        fs::write(&path, contents).map_err(|source| OutputError::Gpio { pin, action, source })
    }
}

impl Outputs for SysfsOutputs {
    fn set(&mut self, device: DeviceName, on: bool) -> Result<(), OutputError> {
        self.write_level(self.pin(device), on)
    }

    fn release(&mut self) -> Result<(), OutputError> {
        for pin in std::mem::take(&mut self.exported) {
            self.write(pin, "unexport", self.root.join("unexport"), &pin.to_string())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

/// Logs output changes instead of driving hardware.
#[derive(Debug, Default)]
pub struct DryRunOutputs {
    fan: bool,
    heater: bool,
}

impl Outputs for DryRunOutputs {
    fn set(&mut self, device: DeviceName, on: bool) -> Result<(), OutputError> {
        let slot = match device {
            DeviceName::Fan => &mut self.fan,
            DeviceName::Heater => &mut self.heater,
        };
        if *slot != on {
            info!(device = %device, on, "Dry run: output changed");
        }
        *slot = on;
        Ok(())
    }

    fn release(&mut self) -> Result<(), OutputError> {
        info!("Dry run: outputs released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    /// Fake sysfs tree with both pins already exported.
    fn fake_sysfs(pins: &[u32]) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let root = std::env::temp_dir().join(format!("aquarium-gpio-{}-{nanos}", std::process::id()));
        for pin in pins {
            fs::create_dir_all(root.join(format!("gpio{pin}"))).unwrap();
        }
        root
    }

    fn read(root: &Path, pin: u32, file: &str) -> String {
        fs::read_to_string(root.join(format!("gpio{pin}")).join(file)).unwrap()
    }

    #[test]
    fn open_configures_outputs_and_drives_them_off() {
        let root = fake_sysfs(&[17, 27]);
        SysfsOutputs::open(&root, 17, 27, false).unwrap();

        assert_eq!(read(&root, 17, "direction"), "out");
        assert_eq!(read(&root, 17, "value"), "0");
        assert_eq!(read(&root, 27, "value"), "0");
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn set_writes_level_for_each_device() {
        let root = fake_sysfs(&[17, 27]);
        let mut outputs = SysfsOutputs::open(&root, 17, 27, false).unwrap();

        outputs.set(DeviceName::Heater, true).unwrap();
        assert_eq!(read(&root, 27, "value"), "1");
        assert_eq!(read(&root, 17, "value"), "0");

        outputs.set(DeviceName::Heater, false).unwrap();
        assert_eq!(read(&root, 27, "value"), "0");
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn active_low_inverts_levels() {
        let root = fake_sysfs(&[5, 6]);
        let mut outputs = SysfsOutputs::open(&root, 5, 6, true).unwrap();
        assert_eq!(read(&root, 5, "value"), "1");

        outputs.set(DeviceName::Fan, true).unwrap();
        assert_eq!(read(&root, 5, "value"), "0");
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn release_leaves_preexported_pins_alone() {
        let root = fake_sysfs(&[17, 27]);
        let mut outputs = SysfsOutputs::open(&root, 17, 27, false).unwrap();
        outputs.release().unwrap();
        assert!(!root.join("unexport").exists());
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn missing_gpio_tree_is_an_error() {
        let err = SysfsOutputs::open("/nonexistent/gpio", 17, 27, false).unwrap_err();
        assert!(err.to_string().contains("GPIO 17"));
    }

    #[test]
    fn dry_run_accepts_everything() {
        let mut outputs = DryRunOutputs::default();
        outputs.set(DeviceName::Fan, true).unwrap();
        assert!(outputs.fan);
        outputs.release().unwrap();
    }
}
