use std::collections::HashMap;
use std::ffi::CString;
use std::time::Duration;

use pcsc::{Card, Context, MAX_BUFFER_SIZE, PNP_NOTIFICATION, Protocols, ReaderState, Scope, ShareMode, State};
use tracing::{debug, info};

use super::{ReaderDriver, ReaderEvent};
use crate::{HardwareError, apdu};

struct PresentTag {
    uid: String,
    card: Card,
}

/// PC/SC-backed driver. Watches every attached reader plus the
/// plug-and-play pseudo reader so attach/detach is noticed without polling.
pub struct PcscDriver {
    ctx: Context,
    /// Index 0 is always the PnP pseudo reader.
    states: Vec<ReaderState>,
    present: HashMap<String, PresentTag>,
}

impl PcscDriver {
    pub fn open() -> Result<Self, HardwareError> {
        let ctx = Context::establish(Scope::User)
            .map_err(|err| HardwareError::Unavailable(format!("PC/SC service unavailable: {err}")))?;
        info!("PC/SC context established");
        Ok(Self {
            ctx,
            states: vec![ReaderState::new(PNP_NOTIFICATION(), State::UNAWARE)],
            present: HashMap::new(),
        })
    }

    fn refresh_readers(&mut self, events: &mut Vec<ReaderEvent>) -> Result<(), HardwareError> {
        let names = match self.ctx.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let present = &mut self.present;
        self.states.retain(|rs| {
            if rs.name() == PNP_NOTIFICATION() || names.iter().any(|n| n.as_c_str() == rs.name()) {
                return true;
            }
            let name = rs.name().to_string_lossy().into_owned();
            if let Some(tag) = present.remove(&name) {
                events.push(ReaderEvent::TagRemoved {
                    reader: name.clone(),
                    uid: tag.uid,
                });
            }
            events.push(ReaderEvent::ReaderDetached { name });
            false
        });

        for name in names {
            if self.states.iter().any(|rs| rs.name() == name.as_c_str()) {
                continue;
            }
            events.push(ReaderEvent::ReaderAttached {
                name: name.to_string_lossy().into_owned(),
            });
            self.states.push(ReaderState::new(name, State::UNAWARE));
        }
        Ok(())
    }

    fn connect(&self, reader: &str) -> Result<Card, HardwareError> {
        let name = CString::new(reader).map_err(|_| HardwareError::Driver {
            message: format!("reader name contains NUL: {reader:?}"),
            fatal: false,
        })?;
        self.ctx
            .connect(&name, ShareMode::Shared, Protocols::ANY)
            .map_err(HardwareError::from)
    }
}

fn exchange(card: &Card, apdu: &[u8]) -> Result<Vec<u8>, HardwareError> {
    let mut buf = [0u8; MAX_BUFFER_SIZE];
    let response = card.transmit(apdu, &mut buf)?;
    Ok(response.to_vec())
}

impl ReaderDriver for PcscDriver {
    fn wait_for_events(&mut self, timeout: Duration) -> Result<Vec<ReaderEvent>, HardwareError> {
        let mut events = Vec::new();
        self.refresh_readers(&mut events)?;

        for rs in &mut self.states {
            rs.sync_current_state();
        }
        match self.ctx.get_status_change(timeout, &mut self.states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => return Ok(events),
            Err(err) => return Err(err.into()),
        }

        let changed: Vec<(String, State, Vec<u8>)> = self
            .states
            .iter()
            .skip(1)
            .filter(|rs| rs.event_state().contains(State::CHANGED))
            .map(|rs| (rs.name().to_string_lossy().into_owned(), rs.event_state(), rs.atr().to_vec()))
            .collect();

        for (reader, state, atr) in changed {
            if state.intersects(State::UNKNOWN | State::IGNORE) {
                // Reader went away; the next refresh reports the detach.
                continue;
            }
            if state.contains(State::PRESENT) && !self.present.contains_key(&reader) {
                let read = self.connect(&reader).and_then(|card| {
                    let response = exchange(&card, &apdu::get_uid())?;
                    let uid = hex::encode_upper(apdu::check_response(&response)?);
                    Ok(PresentTag { uid, card })
                });
                match read {
                    Ok(tag) => {
                        debug!(reader = %reader, uid = %tag.uid, "tag presented");
                        events.push(ReaderEvent::TagPresented {
                            reader: reader.clone(),
                            uid: tag.uid.clone(),
                            atr,
                        });
                        self.present.insert(reader, tag);
                    }
                    Err(err) => events.push(ReaderEvent::Fault {
                        message: format!("failed to read tag on {reader}: {err}"),
                    }),
                }
            } else if state.contains(State::EMPTY) {
                if let Some(tag) = self.present.remove(&reader) {
                    events.push(ReaderEvent::TagRemoved { reader, uid: tag.uid });
                }
            }
        }
        Ok(events)
    }

    fn transmit(&mut self, reader: &str, apdu: &[u8]) -> Result<Vec<u8>, HardwareError> {
        let tag = self
            .present
            .get(reader)
            .ok_or_else(|| HardwareError::NoTag(reader.to_string()))?;
        exchange(&tag.card, apdu)
    }
}

impl From<pcsc::Error> for HardwareError {
    fn from(err: pcsc::Error) -> Self {
        let fatal = matches!(
            err,
            pcsc::Error::NoService | pcsc::Error::ServiceStopped | pcsc::Error::InvalidHandle
        );
        match err {
            pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard => HardwareError::Driver {
                message: "tag left the field".to_string(),
                fatal: false,
            },
            other => HardwareError::Driver {
                message: other.to_string(),
                fatal,
            },
        }
    }
}
