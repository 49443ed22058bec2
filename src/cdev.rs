//! Character device indirection (§6.5): a table of drivers, each backed
//! by read/write [`crate::clist::Clist`] queues.

use crate::block_dev::LDev;
use crate::error::{Error, Result};

/// A character-device driver: open/close lifecycle plus byte-at-a-time
/// read/write and an escape hatch for device-specific control (`ioctl`).
pub trait CharDevice: Send + Sync {
    fn open(&self, minor: u16) -> Result<()>;
    fn close(&self, minor: u16) -> Result<()>;
    fn read(&self, minor: u16, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, minor: u16, buf: &[u8]) -> Result<usize>;
    fn ioctl(&self, minor: u16, request: u32, arg: usize) -> Result<usize>;
}

/// Maps a logical device's major number to its driver, the way
/// [`crate::bcache::DeviceTable`] does for block devices.
#[derive(Default)]
pub struct CdevTable {
    drivers: std::sync::Mutex<std::collections::HashMap<u16, std::sync::Arc<dyn CharDevice>>>,
}

impl CdevTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, major: u16, driver: std::sync::Arc<dyn CharDevice>) {
        self.drivers.lock().unwrap().insert(major, driver);
    }

    fn driver(&self, major: u16) -> Result<std::sync::Arc<dyn CharDevice>> {
        self.drivers
            .lock()
            .unwrap()
            .get(&major)
            .cloned()
            .ok_or(Error::NotFound)
    }

    pub fn open(&self, dev: LDev) -> Result<()> {
        self.driver(dev.major)?.open(dev.minor)
    }

    pub fn close(&self, dev: LDev) -> Result<()> {
        self.driver(dev.major)?.close(dev.minor)
    }

    pub fn read(&self, dev: LDev, buf: &mut [u8]) -> Result<usize> {
        self.driver(dev.major)?.read(dev.minor, buf)
    }

    pub fn write(&self, dev: LDev, buf: &[u8]) -> Result<usize> {
        self.driver(dev.major)?.write(dev.minor, buf)
    }

    pub fn ioctl(&self, dev: LDev, request: u32, arg: usize) -> Result<usize> {
        self.driver(dev.major)?.ioctl(dev.minor, request, arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoDevice {
        last_write: Mutex<Vec<u8>>,
    }

    impl CharDevice for EchoDevice {
        fn open(&self, _minor: u16) -> Result<()> {
            Ok(())
        }
        fn close(&self, _minor: u16) -> Result<()> {
            Ok(())
        }
        fn read(&self, _minor: u16, buf: &mut [u8]) -> Result<usize> {
            let last = self.last_write.lock().unwrap();
            let n = buf.len().min(last.len());
            buf[..n].copy_from_slice(&last[..n]);
            Ok(n)
        }
        fn write(&self, _minor: u16, buf: &[u8]) -> Result<usize> {
            *self.last_write.lock().unwrap() = buf.to_vec();
            Ok(buf.len())
        }
        fn ioctl(&self, _minor: u16, _request: u32, _arg: usize) -> Result<usize> {
            Ok(0)
        }
    }

    #[test]
    fn write_then_read_round_trips_through_the_driver() {
        let table = CdevTable::new();
        table.register(1, std::sync::Arc::new(EchoDevice { last_write: Mutex::new(Vec::new()) }));
        let dev = LDev::new(1, 0);
        table.open(dev).unwrap();
        assert_eq!(table.write(dev, b"hi").unwrap(), 2);
        let mut out = [0u8; 2];
        assert_eq!(table.read(dev, &mut out).unwrap(), 2);
        assert_eq!(&out, b"hi");
    }

    #[test]
    fn unregistered_major_errors() {
        let table = CdevTable::new();
        assert!(table.open(LDev::new(9, 0)).is_err());
    }
}
