use tracing::debug;

use tagrelay_protocol::WriteProgress;

use crate::apdu::{self, PAGE_SIZE};
use crate::driver::ReaderDriver;
use crate::{HardwareError, ndef};

/// Where user memory starts and how much of it there is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagLayout {
    /// First page after the UID, lock and capability-container pages.
    pub first_user_page: u8,
    pub user_bytes: usize,
}

impl Default for TagLayout {
    /// NTAG213: pages 4..=39.
    fn default() -> Self {
        Self {
            first_user_page: 4,
            user_bytes: 144,
        }
    }
}

impl TagLayout {
    /// User bytes that are actually addressable with a one-byte page number.
    pub fn capacity(&self) -> usize {
        let pages_left = 256 - usize::from(self.first_user_page);
        self.user_bytes.min(pages_left * PAGE_SIZE)
    }
}

/// Write `url` as an NDEF URI record to the tag on `reader`, one page at a
/// time. `on_page` fires after every acknowledged page. Returns the number
/// of pages written.
pub fn write_url(
    driver: &mut dyn ReaderDriver,
    reader: &str,
    uid: &str,
    url: &str,
    layout: TagLayout,
    mut on_page: impl FnMut(WriteProgress),
) -> Result<usize, HardwareError> {
    let pages = ndef::url_pages(url);
    let needed = pages.len() * PAGE_SIZE;
    if needed > layout.capacity() {
        return Err(HardwareError::Capacity {
            needed,
            available: layout.capacity(),
        });
    }

    let total = pages.len();
    for (index, data) in pages.into_iter().enumerate() {
        let page = u8::try_from(index)
            .ok()
            .and_then(|offset| layout.first_user_page.checked_add(offset))
            .ok_or(HardwareError::Capacity {
                needed,
                available: layout.capacity(),
            })?;
        let response = driver.transmit(reader, &apdu::update_binary(page, data))?;
        apdu::check_response(&response)?;
        debug!(uid, page, "page written");
        on_page(WriteProgress {
            uid: uid.to_string(),
            page,
            written: index + 1,
            total,
        });
    }
    Ok(total)
}
