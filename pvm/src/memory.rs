//! Guest memory window and host frame pinning.
//!
//! Guest-physical address `gpa` lives at host frame `base + gpa.pfn()`. Only
//! frames below `pfn_limit` exist. Every access the host makes on behalf of the
//! guest goes through [`GuestMemory`], which rejects out of window accesses
//! instead of clamping them.
use crate::{
    addressing::{Gpa, Hfn, PAGE_SIZE},
    fatal, VmError,
};
use bytemuck::Pod;
use spin_lock::SpinLock;
use std::collections::BTreeMap;

/// The memory window of a guest.
pub struct GuestMemory {
    base: Hfn,
    pfn_limit: u32,
    bytes: SpinLock<Box<[u8]>>,
    pins: SpinLock<BTreeMap<Hfn, usize>>,
}

impl GuestMemory {
    /// Create a zero-filled window of `pfn_limit` frames starting at host frame
    /// `base`.
    pub fn new(base: Hfn, pfn_limit: u32) -> Result<Self, VmError> {
        if pfn_limit == 0 {
            return Err(VmError::InvalidConfig("empty guest memory window".into()));
        }
        let len = (pfn_limit as usize)
            .checked_mul(PAGE_SIZE)
            .filter(|len| *len <= u32::MAX as usize + 1)
            .ok_or_else(|| {
                VmError::InvalidConfig(format!("{pfn_limit:#x} frames do not fit in 32 bits"))
            })?;
        Ok(Self {
            base,
            pfn_limit,
            bytes: SpinLock::new(vec![0; len].into_boxed_slice()),
            pins: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Host frame of guest-physical 0.
    #[inline]
    pub fn base(&self) -> Hfn {
        self.base
    }

    /// Number of guest frames.
    #[inline]
    pub fn pfn_limit(&self) -> u32 {
        self.pfn_limit
    }

    /// Size of the window in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.pfn_limit as usize * PAGE_SIZE
    }

    /// Host frame backing guest frame `pfn`, if it exists.
    #[inline]
    pub fn hfn_of(&self, pfn: u32) -> Option<Hfn> {
        (pfn < self.pfn_limit).then(|| self.base + pfn as u64)
    }

    /// Whether `len` bytes starting at `gpa` lie within the window.
    pub fn contains(&self, gpa: Gpa, len: usize) -> bool {
        let start = gpa.as_u32() as usize;
        start
            .checked_add(len)
            .map_or(false, |end| end <= self.size())
    }

    /// Copy guest memory at `gpa` into `buf`.
    pub fn read(&self, gpa: Gpa, buf: &mut [u8]) -> Result<(), VmError> {
        if !self.contains(gpa, buf.len()) {
            return Err(fatal!("bad read address {} len {}", gpa, buf.len()));
        }
        let start = gpa.as_u32() as usize;
        buf.copy_from_slice(&self.bytes.lock()[start..start + buf.len()]);
        Ok(())
    }

    /// Copy `buf` into guest memory at `gpa`.
    pub fn write(&self, gpa: Gpa, buf: &[u8]) -> Result<(), VmError> {
        if !self.contains(gpa, buf.len()) {
            return Err(fatal!("bad write address {} len {}", gpa, buf.len()));
        }
        let start = gpa.as_u32() as usize;
        self.bytes.lock()[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    /// Read a plain-old-data object from guest memory.
    pub fn read_obj<T: Pod>(&self, gpa: Gpa) -> Result<T, VmError> {
        let mut v = T::zeroed();
        self.read(gpa, bytemuck::bytes_of_mut(&mut v))?;
        Ok(v)
    }

    /// Write a plain-old-data object into guest memory.
    pub fn write_obj<T: Pod>(&self, gpa: Gpa, v: &T) -> Result<(), VmError> {
        self.write(gpa, bytemuck::bytes_of(v))
    }

    /// Read a NUL terminated string of at most `max` bytes, including the
    /// terminator. A string running into the end of the window is cut there.
    pub fn read_cstr(&self, gpa: Gpa, max: usize) -> Result<String, VmError> {
        let avail = self.size().saturating_sub(gpa.as_u32() as usize).min(max);
        if avail == 0 {
            return Err(fatal!("bad read address {} len {}", gpa, max));
        }
        let mut buf = vec![0; avail];
        self.read(gpa, &mut buf)?;
        // The last byte is always treated as a terminator.
        let end = buf[..avail - 1]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(avail - 1);
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    /// Pin guest frame `pfn` and return its host frame.
    pub fn pin(&self, pfn: u32) -> Result<Hfn, VmError> {
        let hfn = self
            .hfn_of(pfn)
            .ok_or_else(|| fatal!("failed to get page {:#x}", pfn))?;
        *self.pins.lock().entry(hfn).or_insert(0) += 1;
        Ok(hfn)
    }

    /// Drop one pin of host frame `hfn`.
    pub fn unpin(&self, hfn: Hfn) {
        let mut pins = self.pins.lock();
        match pins.get_mut(&hfn) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                pins.remove(&hfn);
            }
            None => log::warn!("unpinning {:?} which is not pinned", hfn),
        }
    }

    /// Number of outstanding pins of `hfn`.
    pub fn pin_count(&self, hfn: Hfn) -> usize {
        self.pins.lock().get(&hfn).copied().unwrap_or(0)
    }

    /// Number of distinct pinned frames.
    pub fn pinned_frames(&self) -> usize {
        self.pins.lock().len()
    }
}
