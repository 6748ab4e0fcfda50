//! RAM-backed block device for tests and benchmarks

use std::sync::Arc;

use parking_lot::Mutex;

use super::{check_range, BlockDevice, BlockDeviceError, Result};

#[derive(Debug)]
struct RamState {
    data: Vec<u8>,
    erase_counts: Vec<u32>,
    /// Bytes that may still be programmed or erased before power is cut
    budget: Option<u64>,
    powered: bool,
}

/// A block device held in memory.
///
/// Clones share the same storage, so a test can keep one handle while the
/// filesystem owns another, cut power through [`fail_after`] and mount the
/// surviving image again.
///
/// [`fail_after`]: RamBlockDevice::fail_after
#[derive(Debug, Clone)]
pub struct RamBlockDevice {
    state: Arc<Mutex<RamState>>,
    read_size: u64,
    program_size: u64,
    erase_size: u64,
}

impl RamBlockDevice {
    /// Create an erased device of `count` erase units
    pub fn new(read_size: u64, program_size: u64, erase_size: u64, count: u64) -> Self {
        let size = (erase_size * count) as usize;
        Self {
            state: Arc::new(Mutex::new(RamState {
                data: vec![0xff; size],
                erase_counts: vec![0; count as usize],
                budget: None,
                powered: true,
            })),
            read_size,
            program_size,
            erase_size,
        }
    }

    /// Cut power once `bytes` more bytes have been programmed or erased.
    ///
    /// The interrupted operation writes only the bytes that fit in the
    /// budget and fails with [`BlockDeviceError::PowerLoss`]; every later
    /// program or erase fails the same way until [`power_cycle`] is called.
    ///
    /// [`power_cycle`]: RamBlockDevice::power_cycle
    pub fn fail_after(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.budget = Some(bytes);
        state.powered = true;
    }

    /// Restore power and clear any pending fault
    pub fn power_cycle(&self) {
        let mut state = self.state.lock();
        state.budget = None;
        state.powered = true;
    }

    /// Whether an injected power loss has fired
    pub fn power_lost(&self) -> bool {
        !self.state.lock().powered
    }

    /// How many times each erase unit has been erased
    pub fn erase_counts(&self) -> Vec<u32> {
        self.state.lock().erase_counts.clone()
    }

    /// Copy of the raw contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// Spend `len` bytes of the power budget, returning how many may land
    fn consume(state: &mut RamState, len: u64) -> std::result::Result<u64, u64> {
        if !state.powered {
            return Err(0);
        }
        match state.budget {
            None => Ok(len),
            Some(left) if left >= len => {
                state.budget = Some(left - len);
                Ok(len)
            }
            Some(left) => {
                state.budget = Some(0);
                state.powered = false;
                Err(left)
            }
        }
    }
}

impl BlockDevice for RamBlockDevice {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], addr: u64) -> Result<()> {
        let state = self.state.lock();
        check_range(addr, buf.len() as u64, self.read_size, state.data.len() as u64)?;
        let start = addr as usize;
        buf.copy_from_slice(&state.data[start..start + buf.len()]);
        Ok(())
    }

    fn program(&mut self, data: &[u8], addr: u64) -> Result<()> {
        let mut state = self.state.lock();
        check_range(addr, data.len() as u64, self.program_size, state.data.len() as u64)?;
        let start = addr as usize;
        match Self::consume(&mut state, data.len() as u64) {
            Ok(_) => {
                state.data[start..start + data.len()].copy_from_slice(data);
                Ok(())
            }
            Err(partial) => {
                let partial = partial as usize;
                state.data[start..start + partial].copy_from_slice(&data[..partial]);
                Err(BlockDeviceError::PowerLoss)
            }
        }
    }

    fn erase(&mut self, addr: u64, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        check_range(addr, size, self.erase_size, state.data.len() as u64)?;
        let start = addr as usize;
        let (landed, result) = match Self::consume(&mut state, size) {
            Ok(n) => (n as usize, Ok(())),
            Err(n) => (n as usize, Err(BlockDeviceError::PowerLoss)),
        };
        state.data[start..start + landed].fill(0xff);
        if landed > 0 {
            let first = (addr / self.erase_size) as usize;
            let units = (size / self.erase_size) as usize;
            for count in &mut state.erase_counts[first..first + units] {
                *count += 1;
            }
        }
        result
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_size(&self) -> u64 {
        self.read_size
    }

    fn program_size(&self) -> u64 {
        self.program_size
    }

    fn erase_size(&self) -> u64 {
        self.erase_size
    }

    fn size(&self) -> u64 {
        self.state.lock().data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_storage() {
        let mut dev = RamBlockDevice::new(1, 1, 512, 4);
        let mut other = dev.clone();
        dev.program(b"pebble", 600).unwrap();

        let mut buf = [0u8; 6];
        other.read(&mut buf, 600).unwrap();
        assert_eq!(&buf, b"pebble");

        other.erase(512, 512).unwrap();
        dev.read(&mut buf, 600).unwrap();
        assert_eq!(buf, [0xff; 6]);
        assert_eq!(dev.erase_counts(), vec![0, 1, 0, 0]);
    }

    #[test]
    fn test_fail_after_tears_program() {
        let mut dev = RamBlockDevice::new(1, 1, 512, 2);
        dev.fail_after(3);
        assert!(matches!(
            dev.program(b"abcdef", 0),
            Err(BlockDeviceError::PowerLoss)
        ));
        assert!(dev.power_lost());

        // Further writes are refused until power returns
        assert!(dev.program(b"x", 100).is_err());
        assert!(dev.erase(0, 512).is_err());

        let mut buf = [0u8; 6];
        dev.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"abc\xff\xff\xff");

        dev.power_cycle();
        dev.program(b"x", 100).unwrap();
    }

    #[test]
    fn test_alignment_enforced() {
        let mut dev = RamBlockDevice::new(16, 16, 512, 2);
        let mut buf = [0u8; 8];
        assert!(matches!(
            dev.read(&mut buf, 0),
            Err(BlockDeviceError::Misaligned { .. })
        ));
    }
}
