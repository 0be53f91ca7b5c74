//! The per-process file table: a bounded array of descriptions with
//! their close-on-exec bits.

use crate::prelude::*;

use super::vfs::file::File;

/// Maximum open descriptors per process.
pub const MAX_OPEN_FILES: usize = 256;

#[derive(Clone)]
enum Slot {
    /// Reserved by an in-flight open, so a racing open cannot take the
    /// same descriptor.
    Reserved,
    Open { file: Arc<File>, cloexec: bool },
}

pub struct FileTable {
    slots: Vec<Option<Slot>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_OPEN_FILES],
        }
    }

    pub fn get(&self, fd: i32) -> Option<Arc<File>> {
        let slot = self.slots.get(usize::try_from(fd).ok()?)?;
        match slot {
            Some(Slot::Open { file, .. }) => Some(file.clone()),
            _ => None,
        }
    }

    /// Reserves the lowest free descriptor.
    pub fn reserve(&mut self) -> Option<i32> {
        let fd = self.slots.iter().position(|slot| slot.is_none())?;
        self.slots[fd] = Some(Slot::Reserved);
        Some(fd as i32)
    }

    /// Fills (or frees, with `None`) a previously reserved descriptor.
    pub fn set(&mut self, fd: i32, file: Option<Arc<File>>, cloexec: bool) {
        let slot = &mut self.slots[fd as usize];
        *slot = file.map(|file| Slot::Open { file, cloexec });
    }

    /// Installs a description at `fd`, closing whatever was there.
    pub fn dup_into(&mut self, fd: i32, file: Arc<File>, cloexec: bool) -> Result<i32> {
        let index = usize::try_from(fd).map_err(|_| Error::new(Errno::EBADF))?;
        if index >= MAX_OPEN_FILES {
            return_errno!(Errno::EBADF);
        }
        self.slots[index] = Some(Slot::Open { file, cloexec });
        Ok(fd)
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        let index = usize::try_from(fd).map_err(|_| Error::new(Errno::EBADF))?;
        match self.slots.get_mut(index) {
            Some(slot @ Some(Slot::Open { .. })) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::new(Errno::EBADF)),
        }
    }

    /// Fork: every open descriptor gets its own description with the
    /// same flags and offset.
    pub fn clone_for_fork(&self) -> Self {
        Self {
            slots: self
                .slots
                .iter()
                .map(|slot| match slot {
                    Some(Slot::Open { file, cloexec }) => Some(Slot::Open {
                        file: file.clone_for_fork(),
                        cloexec: *cloexec,
                    }),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

#[if_cfg_ktest]
mod test {
    use super::*;

    #[ktest]
    fn reserve_hands_out_lowest_free() {
        let mut table = FileTable::new();
        assert_eq!(table.reserve(), Some(0));
        assert_eq!(table.reserve(), Some(1));
        table.set(0, None, false);
        assert_eq!(table.reserve(), Some(0));
    }

    #[ktest]
    fn close_of_reserved_or_free_is_badf() {
        let mut table = FileTable::new();
        assert!(table.close(0).is_err());
        let fd = table.reserve().unwrap();
        // Reserved but not yet open.
        assert!(table.close(fd).is_err());
    }
}
