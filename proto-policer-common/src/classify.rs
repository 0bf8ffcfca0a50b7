use core::fmt;

pub const ETH_HDR_LEN: usize = 14;
pub const VLAN_HDR_LEN: usize = 4;
/// Maximum number of stacked VLAN tags skipped before the protocol field is taken as final.
/// The kernel verifier rejects unbounded loops, so this also bounds the parse.
pub const VLAN_MAX_DEPTH: usize = 2;

const H_PROTO_OFFSET: usize = 12;
/// Offset of the encapsulated protocol inside a VLAN tag (after the 2-byte TCI).
const VLAN_PROTO_OFFSET: usize = 2;

/// 16-bit protocol field exactly as it sits on the wire.
///
/// The value is kept in network byte order and is only ever compared against constants in
/// the same order, mirroring the `bpf_htons(ETH_P_*)` comparisons of kernel code.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct EtherType(u16);

impl EtherType {
    pub const IPV4: EtherType = EtherType::from_host(0x0800);
    pub const IPV6: EtherType = EtherType::from_host(0x86dd);
    pub const VLAN_8021Q: EtherType = EtherType::from_host(0x8100);
    pub const VLAN_8021AD: EtherType = EtherType::from_host(0x88a8);

    pub const fn from_host(value: u16) -> Self {
        EtherType(value.to_be())
    }

    pub const fn from_wire(bytes: [u8; 2]) -> Self {
        EtherType(u16::from_ne_bytes(bytes))
    }

    pub const fn to_host(self) -> u16 {
        u16::from_be(self.0)
    }

    pub fn is_vlan(self) -> bool {
        self == EtherType::VLAN_8021Q || self == EtherType::VLAN_8021AD
    }
}

impl fmt::Debug for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EtherType({:#06x})", self.to_host())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// Frame is shorter than the Ethernet base header.
    Truncated,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated => {
                write!(f, "frame shorter than the {ETH_HDR_LEN}-byte Ethernet header")
            }
        }
    }
}

/// Bounds-checked read access to one received frame.
///
/// Implemented for plain byte slices and for the kernel packet window, so the same parser
/// runs in both places.
pub trait FrameBytes {
    /// Number of valid bytes in the frame.
    fn frame_len(&self) -> usize;

    /// Reads the two bytes at `offset`, or `None` when they are not inside the frame.
    fn wire_u16(&self, offset: usize) -> Option<[u8; 2]>;
}

impl FrameBytes for [u8] {
    fn frame_len(&self) -> usize {
        self.len()
    }

    fn wire_u16(&self, offset: usize) -> Option<[u8; 2]> {
        let end = offset.checked_add(2)?;
        match self.get(offset..end) {
            Some(&[a, b]) => Some([a, b]),
            _ => None,
        }
    }
}

/// Result of a successful classification.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// Protocol field after skipping at most `VLAN_MAX_DEPTH` tags.
    pub ethertype: EtherType,
    /// Number of VLAN tags that were skipped.
    pub vlan_tags: u8,
    /// Offset of the header following the last skipped tag.
    pub l3_offset: usize,
}

/// Extracts the effective ethertype of a frame.
///
/// A tag that does not fully fit ends the walk with the protocol seen so far; only a frame
/// shorter than the base header is an error.
#[inline(always)]
pub fn classify<F: FrameBytes + ?Sized>(frame: &F) -> Result<Frame, ParseError> {
    if frame.frame_len() < ETH_HDR_LEN {
        return Err(ParseError::Truncated);
    }
    let mut ethertype = match frame.wire_u16(H_PROTO_OFFSET) {
        Some(bytes) => EtherType::from_wire(bytes),
        None => return Err(ParseError::Truncated),
    };

    let mut offset = ETH_HDR_LEN;
    let mut vlan_tags = 0u8;
    for _ in 0..VLAN_MAX_DEPTH {
        if !ethertype.is_vlan() {
            break;
        }
        if offset + VLAN_HDR_LEN > frame.frame_len() {
            break;
        }
        match frame.wire_u16(offset + VLAN_PROTO_OFFSET) {
            Some(bytes) => ethertype = EtherType::from_wire(bytes),
            None => break,
        }
        offset += VLAN_HDR_LEN;
        vlan_tags += 1;
    }

    Ok(Frame {
        ethertype,
        vlan_tags,
        l3_offset: offset,
    })
}

/// Ethernet base header view.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EthHdr {
    pub dest: [u8; 6],
    pub source: [u8; 6],
    pub proto: [u8; 2],
}

impl EthHdr {
    /// Borrows the base header at the start of `frame`.
    pub fn view(frame: &[u8]) -> Option<&EthHdr> {
        if frame.len() < ETH_HDR_LEN {
            return None;
        }
        // SAFETY: EthHdr is repr(C), made only of byte arrays (align 1, size 14), and the
        // length check above keeps the view inside `frame`.
        Some(unsafe { &*(frame.as_ptr() as *const EthHdr) })
    }
}
