//! Builder for Runtime, all devices share one configuration
use crate::{runtime::Runtime, Error};
use stream_manager::{DeviceConfig, StreamManager};

/// Builder for the runtime
pub struct Builder {
    device_count: usize,
    compute_units: usize,
    max_work_group_size: usize,
    local_mem_size: usize,
    supports_3d_copy: bool,
}

macro_rules! config {
    ($name:ident, $t: ty, $comment: literal) => {
        #[doc=$comment]
        pub fn $name(mut self, $name: $t) -> Self {
            self.$name = $name;
            self
        }
    };
}

impl Default for Builder {
    fn default() -> Self {
        let device = DeviceConfig::default();
        Builder {
            device_count: 1,
            compute_units: device.compute_units,
            max_work_group_size: device.max_work_group_size,
            local_mem_size: device.local_mem_size,
            supports_3d_copy: device.supports_3d_copy,
        }
    }
}

impl Builder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Builder::default()
    }

    config!(device_count, usize, "Number of devices");
    config!(compute_units, usize, "Worker threads per kernel launch");
    config!(max_work_group_size, usize, "Maximum work-items in one work-group");
    config!(local_mem_size, usize, "Local memory bytes per work-group");
    config!(supports_3d_copy, bool, "Whether devices perform 3D copies");

    /// Start the devices and the task graph.
    pub fn build(self) -> Result<Runtime, Error> {
        if self.device_count == 0 {
            return Err(Error::InvalidParameter(
                "a runtime needs at least one device".to_string(),
            ));
        }
        if self.compute_units == 0 || self.max_work_group_size == 0 {
            return Err(Error::InvalidParameter(
                "compute units and work-group size must be positive".to_string(),
            ));
        }
        let config = DeviceConfig {
            compute_units: self.compute_units,
            max_work_group_size: self.max_work_group_size,
            local_mem_size: self.local_mem_size,
            supports_3d_copy: self.supports_3d_copy,
            ..DeviceConfig::default()
        };
        let handle = StreamManager::from_configs(&vec![config; self.device_count]).run();
        let runtime = Runtime::from_handle(handle)?;
        log::info!(
            "Runtime started with {} devices, {:?}",
            self.device_count,
            config
        );
        Ok(runtime)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    #[serial]
    #[test]
    fn test_build() {
        let runtime = Builder::new()
            .device_count(3)
            .compute_units(2)
            .supports_3d_copy(false)
            .build()
            .unwrap();
        assert_eq!(runtime.device_count(), 3);
        let config = runtime.device_config(2).unwrap();
        assert_eq!(config.compute_units, 2);
        assert!(!config.supports_3d_copy);
        assert!(matches!(
            Builder::new().device_count(0).build(),
            Err(Error::InvalidParameter(_))
        ));
    }
}
