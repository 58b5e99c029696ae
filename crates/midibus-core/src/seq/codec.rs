//! Sequencer event <-> raw byte conversion
//!
//! Short messages go through the ALSA byte-stream coder. SysEx never does:
//! it travels as a variable-length event whose payload is the raw `F0 ... F7`.

use alsa::seq::{Event, EventType, MidiEvent};

use crate::message::MAX_MESSAGE_SIZE;

/// Create a coder with running status disabled
///
/// Every emitted message must carry its own status byte because one datagram
/// is one self-contained message.
pub fn new_coder() -> alsa::Result<MidiEvent> {
    let coder = MidiEvent::new(MAX_MESSAGE_SIZE as u32)?;
    coder.enable_running_status(false);
    Ok(coder)
}

/// Events the sequencer generates about itself; they never carry MIDI bytes
pub fn is_administrative(kind: EventType) -> bool {
    matches!(
        kind,
        EventType::None
            | EventType::ClientStart
            | EventType::ClientExit
            | EventType::ClientChange
            | EventType::PortStart
            | EventType::PortExit
            | EventType::PortChange
            | EventType::PortSubscribed
            | EventType::PortUnsubscribed
            | EventType::Usr0
            | EventType::Usr1
            | EventType::Usr2
            | EventType::Usr3
            | EventType::Usr4
            | EventType::Usr5
            | EventType::Usr6
            | EventType::Usr7
            | EventType::Usr8
            | EventType::Usr9
            | EventType::Bounce
            | EventType::UsrVar0
            | EventType::UsrVar1
            | EventType::UsrVar2
            | EventType::UsrVar3
            | EventType::UsrVar4
            | EventType::Oss
    )
}

/// Decode one inbound event into wire bytes
///
/// Returns `None` for administrative events and for events the decoder
/// cannot express. The decoder is reset afterwards so a partial message
/// never leaks into the next one.
pub fn decode_event(decoder: &mut MidiEvent, event: &mut Event, buf: &mut [u8]) -> Option<Vec<u8>> {
    let kind = event.get_type();
    if is_administrative(kind) {
        return None;
    }

    if kind == EventType::Sysex {
        return event.get_ext().filter(|ext| !ext.is_empty()).map(<[u8]>::to_vec);
    }

    let decoded = decoder.decode(buf, event);
    decoder.reset_decode();
    match decoded {
        Ok(0) => None,
        Ok(len) => Some(buf[..len].to_vec()),
        Err(e) => {
            log::debug!("[SEQ] Cannot decode {:?}: {}", kind, e);
            None
        }
    }
}

/// Encode a byte stream into sequencer events, handing each to `emit`
///
/// One buffer may hold several back-to-back messages.
pub fn encode_bytes<F>(encoder: &mut MidiEvent, bytes: &[u8], mut emit: F) -> alsa::Result<()>
where
    F: FnMut(&mut Event) -> alsa::Result<()>,
{
    encoder.reset_encode();
    let mut rest = bytes;
    while !rest.is_empty() {
        let (consumed, event) = encoder.encode(rest)?;
        if let Some(mut event) = event {
            emit(&mut event)?;
        }
        if consumed == 0 {
            break;
        }
        rest = &rest[consumed..];
    }
    Ok(())
}

/// Variable-length SysEx event carrying `bytes` verbatim
pub fn sysex_event(bytes: &[u8]) -> Event<'_> {
    Event::new_ext(EventType::Sysex, bytes)
}
