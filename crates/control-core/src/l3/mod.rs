//! The Layer 3 frame model at the L2/L3 boundary.
//!
//! The data-link layer below delivers frames tagged with a primitive, a
//! SAPI, and (for data frames) a protocol discriminator and message type.
//! Bit-level message codecs are out of scope here: data frames arrive with
//! the message already decoded into the [`L3Message`] union, or with the
//! raw octets when the payload is opaque (relay of a peer's
//! HandoverCommand) or unparseable.

pub mod messages;

pub use messages::*;

use bytes::Bytes;
use std::fmt;

/// Data-link primitives distinguished at the L2/L3 boundary. Exactly these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Primitive {
    EstablishIndication = 0,
    EstablishConfirm,
    ReleaseIndication,
    ReleaseRequest,
    HardReleaseRequest,
    HandoverAccess,
    Data,
    UnitData,
    MdlErrorIndication,
    EstablishRequest,
}

impl Primitive {
    pub fn is_data(&self) -> bool {
        matches!(self, Primitive::Data | Primitive::UnitData)
    }
}

/// L3 protocol discriminators, GSM 04.07 11.2.3.1.1 (the subset we serve).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum L3Pd {
    Cc = 0x3,
    Mm = 0x5,
    Rr = 0x6,
    Sms = 0x9,
    NonCallSs = 0xB,
}

/// LAPDm SAPI selector. SMS rides SAPI 3; on a TCH the SAPI 3 link runs on
/// the associated SACCH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sapi {
    Sapi0,
    Sapi3,
    Sapi0Sacch,
    Sapi3Sacch,
}

/// Dedicated-channel types we allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Sdcch,
    TchF,
}

/// A 20 ms vocoder frame crossing the TCH <-> RTP boundary.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
}

impl AudioFrame {
    pub fn new(data: impl Into<Bytes>) -> AudioFrame {
        AudioFrame { data: data.into() }
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// The body of an L3 frame.
#[derive(Debug, Clone)]
pub enum FrameBody {
    /// Naked primitive, no payload.
    Empty,
    /// A decoded L3 message.
    Message(L3Message),
    /// Raw octets: opaque relays and unparseable uplink frames.
    Raw {
        pd: L3Pd,
        mti: u8,
        ti: u8,
        payload: Bytes,
    },
}

/// One frame at the L2/L3 boundary.
#[derive(Debug, Clone)]
pub struct L3Frame {
    pub primitive: Primitive,
    pub sapi: Sapi,
    pub body: FrameBody,
}

impl L3Frame {
    /// A naked primitive frame.
    pub fn primitive(primitive: Primitive, sapi: Sapi) -> L3Frame {
        L3Frame {
            primitive,
            sapi,
            body: FrameBody::Empty,
        }
    }

    /// A data frame carrying a decoded message on SAPI 0.
    pub fn data(message: L3Message) -> L3Frame {
        L3Frame {
            primitive: Primitive::Data,
            sapi: Sapi::Sapi0,
            body: FrameBody::Message(message),
        }
    }

    /// A data frame carrying a decoded message on the given SAPI.
    pub fn data_on(message: L3Message, sapi: Sapi) -> L3Frame {
        L3Frame {
            primitive: Primitive::Data,
            sapi,
            body: FrameBody::Message(message),
        }
    }

    /// A raw (opaque or undecodable) data frame.
    pub fn raw(pd: L3Pd, mti: u8, ti: u8, payload: Bytes) -> L3Frame {
        L3Frame {
            primitive: Primitive::Data,
            sapi: Sapi::Sapi0,
            body: FrameBody::Raw {
                pd,
                mti,
                ti,
                payload,
            },
        }
    }

    pub fn is_data(&self) -> bool {
        self.primitive.is_data()
    }

    pub fn message(&self) -> Option<&L3Message> {
        match &self.body {
            FrameBody::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn pd(&self) -> Option<L3Pd> {
        match &self.body {
            FrameBody::Message(m) => Some(m.pd()),
            FrameBody::Raw { pd, .. } => Some(*pd),
            FrameBody::Empty => None,
        }
    }

    pub fn mti(&self) -> Option<u8> {
        match &self.body {
            FrameBody::Message(m) => Some(m.mti()),
            FrameBody::Raw { mti, .. } => Some(*mti),
            FrameBody::Empty => None,
        }
    }

    /// The transaction identifier carried by the frame. Only CC, SMS and SS
    /// frames have a meaningful one.
    pub fn ti(&self) -> Option<u8> {
        match &self.body {
            FrameBody::Message(m) => m.ti(),
            FrameBody::Raw { ti, .. } => Some(*ti),
            FrameBody::Empty => None,
        }
    }
}

impl fmt::Display for L3Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            FrameBody::Empty => write!(f, "{:?}({:?})", self.primitive, self.sapi),
            FrameBody::Message(m) => write!(f, "{:?}({:?},{})", self.primitive, self.sapi, m),
            FrameBody::Raw { pd, mti, .. } => {
                write!(f, "{:?}({:?},raw pd={:?} mti=0x{:x})", self.primitive, self.sapi, pd, mti)
            }
        }
    }
}

/// Dispatch keys for the state-machine framework.
///
/// One integer space serves four kinds of input:
///   0x000..=0x0FF  private procedure states
///   0x100..=0x1FF  data-link primitives
///   0x200..=0x2FF  SIP dialog states
///   (pd<<8)|mti    decoded L3 messages, pd >= 3
///
/// The MTI is masked with 0xBF: bit 6 is the send-sequence bit on uplink CC
/// messages (04.08 10.4) and must not affect dispatch.
pub type DispatchKey = u32;

pub const MTI_DISPATCH_MASK: u8 = 0xBF;

pub const fn l3_case(pd: L3Pd, mti: u8) -> DispatchKey {
    ((pd as u32) << 8) | (mti & MTI_DISPATCH_MASK) as u32
}

pub const fn primitive_case(prim: Primitive) -> DispatchKey {
    0x100 + prim as u32
}

/// Named dispatch keys for the messages the procedures match on.
pub mod key {
    use super::{l3_case, primitive_case, DispatchKey, L3Pd, Primitive};

    pub const EST_INDICATION: DispatchKey = primitive_case(Primitive::EstablishIndication);
    pub const EST_CONFIRM: DispatchKey = primitive_case(Primitive::EstablishConfirm);

    pub const MM_LOCATION_UPDATING_REQUEST: DispatchKey = l3_case(L3Pd::Mm, 0x08);
    pub const MM_IMSI_DETACH: DispatchKey = l3_case(L3Pd::Mm, 0x01);
    pub const MM_AUTHENTICATION_RESPONSE: DispatchKey = l3_case(L3Pd::Mm, 0x14);
    pub const MM_IDENTITY_RESPONSE: DispatchKey = l3_case(L3Pd::Mm, 0x19);
    pub const MM_TMSI_REALLOC_COMPLETE: DispatchKey = l3_case(L3Pd::Mm, 0x1B);
    pub const MM_CM_SERVICE_ABORT: DispatchKey = l3_case(L3Pd::Mm, 0x23);
    pub const MM_CM_SERVICE_REQUEST: DispatchKey = l3_case(L3Pd::Mm, 0x24);

    pub const CC_ALERTING: DispatchKey = l3_case(L3Pd::Cc, 0x01);
    pub const CC_SETUP: DispatchKey = l3_case(L3Pd::Cc, 0x05);
    pub const CC_CONNECT: DispatchKey = l3_case(L3Pd::Cc, 0x07);
    pub const CC_CALL_CONFIRMED: DispatchKey = l3_case(L3Pd::Cc, 0x08);
    pub const CC_EMERGENCY_SETUP: DispatchKey = l3_case(L3Pd::Cc, 0x0E);
    pub const CC_CONNECT_ACK: DispatchKey = l3_case(L3Pd::Cc, 0x0F);
    pub const CC_HOLD: DispatchKey = l3_case(L3Pd::Cc, 0x18);
    pub const CC_DISCONNECT: DispatchKey = l3_case(L3Pd::Cc, 0x25);
    pub const CC_RELEASE: DispatchKey = l3_case(L3Pd::Cc, 0x2D);
    pub const CC_RELEASE_COMPLETE: DispatchKey = l3_case(L3Pd::Cc, 0x2A);
    pub const CC_STOP_DTMF: DispatchKey = l3_case(L3Pd::Cc, 0x31);
    pub const CC_START_DTMF: DispatchKey = l3_case(L3Pd::Cc, 0x35);

    pub const RR_PAGING_RESPONSE: DispatchKey = l3_case(L3Pd::Rr, 0x27);
    pub const RR_ASSIGNMENT_COMPLETE: DispatchKey = l3_case(L3Pd::Rr, 0x29);
    pub const RR_ASSIGNMENT_FAILURE: DispatchKey = l3_case(L3Pd::Rr, 0x2F);
    pub const RR_MODE_MODIFY_ACK: DispatchKey = l3_case(L3Pd::Rr, 0x17);
    pub const RR_CIPHERING_MODE_COMPLETE: DispatchKey = l3_case(L3Pd::Rr, 0x32);
    pub const RR_CLASSMARK_CHANGE: DispatchKey = l3_case(L3Pd::Rr, 0x16);
    pub const RR_HANDOVER_COMPLETE: DispatchKey = l3_case(L3Pd::Rr, 0x2C);
    pub const RR_HANDOVER_FAILURE: DispatchKey = l3_case(L3Pd::Rr, 0x28);

    pub const SMS_CP_DATA: DispatchKey = l3_case(L3Pd::Sms, 0x01);
    pub const SMS_CP_ACK: DispatchKey = l3_case(L3Pd::Sms, 0x04);
    pub const SMS_CP_ERROR: DispatchKey = l3_case(L3Pd::Sms, 0x10);

    pub const SS_RELEASE_COMPLETE: DispatchKey = l3_case(L3Pd::NonCallSs, 0x2A);
    pub const SS_FACILITY: DispatchKey = l3_case(L3Pd::NonCallSs, 0x3A);
    pub const SS_REGISTER: DispatchKey = l3_case(L3Pd::NonCallSs, 0x3B);
}

pub const fn is_private_state(key: DispatchKey) -> bool {
    key < 0x100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_key_masks_send_sequence_bit() {
        // Uplink Connect may arrive with bit 6 set.
        assert_eq!(l3_case(L3Pd::Cc, 0x47), l3_case(L3Pd::Cc, 0x07));
        assert_ne!(l3_case(L3Pd::Cc, 0x07), l3_case(L3Pd::Mm, 0x07));
    }

    #[test]
    fn key_spaces_do_not_collide() {
        assert!(is_private_state(0x42));
        assert!(!is_private_state(primitive_case(Primitive::EstablishIndication)));
        assert!(l3_case(L3Pd::Cc, 0) >= 0x300);
    }
}
