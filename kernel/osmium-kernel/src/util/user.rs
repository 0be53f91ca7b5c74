//! Copying between kernel and user memory.
//!
//! User addresses are never dereferenced directly: every access pins the
//! backing frame through the current address space (faulting it in and
//! breaking copy-on-write as needed) and goes through the direct map.
//! A pointer the mapping tree cannot satisfy is a plain `EFAULT`.

use osmium_frame::config::USER_ADDR_MAX;

use crate::prelude::*;

/// Longest string `read_cstring` accepts, terminator included.
pub const USER_STRING_MAX: usize = 0x2000;

fn check_range(uaddr: Vaddr, len: usize) -> Result<()> {
    let end = uaddr.checked_add(len).ok_or(Error::new(Errno::EFAULT))?;
    if end > USER_ADDR_MAX {
        return_errno!(Errno::EFAULT);
    }
    Ok(())
}

/// Copies `buf.len()` bytes in from user memory.
pub fn read_bytes(uaddr: Vaddr, buf: &mut [u8]) -> Result<()> {
    check_range(uaddr, buf.len())?;
    let space = current!().address_space();
    let mut pos = uaddr;
    let mut done = 0;
    while done < buf.len() {
        let page = space.get_user_page(pos, false)?;
        let in_page = pos & 0xFFF;
        let chunk = (PAGE_SIZE - in_page).min(buf.len() - done);
        // Safety: pinned direct-map page; chunk stays inside it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (page + in_page) as *const u8,
                buf[done..].as_mut_ptr(),
                chunk,
            );
        }
        space.unref_user_page(page);
        done += chunk;
        pos += chunk;
    }
    Ok(())
}

/// Copies `buf` out to user memory.
pub fn write_bytes(uaddr: Vaddr, buf: &[u8]) -> Result<()> {
    check_range(uaddr, buf.len())?;
    let space = current!().address_space();
    let mut pos = uaddr;
    let mut done = 0;
    while done < buf.len() {
        let page = space.get_user_page(pos, true)?;
        let in_page = pos & 0xFFF;
        let chunk = (PAGE_SIZE - in_page).min(buf.len() - done);
        // Safety: as in read_bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf[done..].as_ptr(),
                (page + in_page) as *mut u8,
                chunk,
            );
        }
        space.unref_user_page(page);
        done += chunk;
        pos += chunk;
    }
    Ok(())
}

/// Reads one plain-data value.
pub fn read_val<T: Copy>(uaddr: Vaddr) -> Result<T> {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    // Safety: MaybeUninit gives us a writable byte view of exactly
    // size_of::<T>() bytes; T is Copy (plain data).
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(
            value.as_mut_ptr() as *mut u8,
            core::mem::size_of::<T>(),
        )
    };
    read_bytes(uaddr, bytes)?;
    // Safety: fully initialized by the copy.
    Ok(unsafe { value.assume_init() })
}

/// Writes one plain-data value.
pub fn write_val<T: Copy>(uaddr: Vaddr, value: &T) -> Result<()> {
    // Safety: plain-data byte view of the value.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            value as *const T as *const u8,
            core::mem::size_of::<T>(),
        )
    };
    write_bytes(uaddr, bytes)
}

/// Reads a NUL-terminated string, bounded by [`USER_STRING_MAX`].
/// Overlong strings fail with `EOVERFLOW`, unterminated or unmapped
/// ones with `EFAULT`.
pub fn read_cstring(uaddr: Vaddr) -> Result<String> {
    let space = current!().address_space();
    let mut out: Vec<u8> = Vec::new();
    let mut pos = uaddr;
    loop {
        check_range(pos, 1)?;
        let page = space.get_user_page(pos, false)?;
        let in_page = pos & 0xFFF;
        let chunk = PAGE_SIZE - in_page;
        // Safety: pinned direct-map page.
        let bytes =
            unsafe { core::slice::from_raw_parts((page + in_page) as *const u8, chunk) };
        let nul = bytes.iter().position(|&b| b == 0);
        let take = nul.unwrap_or(chunk);
        if out.len() + take > USER_STRING_MAX {
            space.unref_user_page(page);
            return_errno!(Errno::EOVERFLOW);
        }
        out.extend_from_slice(&bytes[..take]);
        space.unref_user_page(page);
        if nul.is_some() {
            break;
        }
        pos += chunk;
    }
    String::from_utf8(out).map_err(|_| Error::with_message(Errno::EINVAL, "non-UTF-8 path"))
}
