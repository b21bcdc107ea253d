//! Protocol inference
//!
//! Decides which protocol state machine to install for a connection by
//! peeking at the first byte sent by the client. RESP requests always
//! start with `*` (an array); anything else is assumed to be memcached
//! text protocol.

use super::{mctext::MctextFsm, redis::RedisFsm, Fsm, FsmError};
use crate::assembly::reader::{ReadError, Reader};

/// Inspect the first client byte and pick a state machine.
///
/// If the first byte was lost, truncate the client stream so inference
/// retries from a fresh packet boundary.
pub fn infer(client: &mut Reader) -> Result<Fsm, FsmError> {
    let first = match client.peek_n(1) {
        Ok(out) => out[0],
        Err(ReadError::LostData(_)) => {
            client.truncate();
            return Err(ReadError::ShortRead.into());
        }
        Err(e) => return Err(e.into()),
    };
    Ok(match first {
        b'*' => Fsm::Redis(RedisFsm::new()),
        _ => Fsm::Mctext(MctextFsm::new()),
    })
}
