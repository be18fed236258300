use super::address;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    ReadReq,
    WriteReq,
    ReadResp,
    WriteResp,
}

/// A memory request or response travelling between a core, a cache, the bus
/// and memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Packet {
    pub addr: address,
    pub size: u32,
    pub kind: Kind,
    /// payload of `size` bytes (zeroed for read requests until filled)
    pub data: Vec<u8>,
    /// id of the core or partition that issued this packet
    pub requestor: usize,
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}@{:#x}+{}", self.kind, self.addr, self.size)
    }
}

impl Packet {
    #[must_use]
    pub fn read(addr: address, size: u32) -> Self {
        Self {
            addr,
            size,
            kind: Kind::ReadReq,
            data: vec![0; size as usize],
            requestor: 0,
        }
    }

    #[must_use]
    pub fn write(addr: address, data: Vec<u8>) -> Self {
        Self {
            addr,
            size: data.len() as u32,
            kind: Kind::WriteReq,
            data,
            requestor: 0,
        }
    }

    #[must_use]
    pub fn with_requestor(mut self, requestor: usize) -> Self {
        self.requestor = requestor;
        self
    }

    #[must_use]
    pub fn is_read(&self) -> bool {
        matches!(self.kind, Kind::ReadReq | Kind::ReadResp)
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self.kind, Kind::WriteReq | Kind::WriteResp)
    }

    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self.kind, Kind::ReadResp | Kind::WriteResp)
    }

    #[must_use]
    pub fn needs_response(&self) -> bool {
        !self.is_response()
    }

    /// Turn this request into the matching response in place.
    pub fn make_response(&mut self) {
        self.kind = match self.kind {
            Kind::ReadReq => Kind::ReadResp,
            Kind::WriteReq => Kind::WriteResp,
            other => panic!("packet {other:?} is already a response"),
        };
    }

    #[must_use]
    pub fn block_addr(&self, block_size: u32) -> address {
        self.addr & !address::from(block_size - 1)
    }

    #[must_use]
    pub fn offset_in_block(&self, block_size: u32) -> usize {
        (self.addr & address::from(block_size - 1)) as usize
    }

    /// Does this packet overwrite a whole aligned block?
    #[must_use]
    pub fn covers_block(&self, block_size: u32) -> bool {
        self.addr == self.block_addr(block_size) && self.size == block_size
    }

    /// Copy this packet's payload into a block buffer at the address offset.
    pub fn write_data_to_block(&self, block: &mut [u8]) {
        let offset = self.offset_in_block(block.len() as u32);
        block[offset..offset + self.size as usize].copy_from_slice(&self.data);
    }

    /// Fill this packet's payload from a block buffer at the address offset.
    pub fn set_data_from_block(&mut self, block: &[u8]) {
        let offset = self.offset_in_block(block.len() as u32);
        self.data
            .copy_from_slice(&block[offset..offset + self.size as usize]);
    }
}

/// Operation announced on the bus alongside every transaction, so that
/// snoopers know how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, Serialize, Deserialize)]
pub enum BusOp {
    /// read a shareable copy
    BusRd,
    /// read for ownership, invalidating peers
    BusRdX,
    /// broadcast new data to sharers without invalidating
    BusUpd,
    /// read miss immediately followed by an update
    BusRdUpd,
}

impl BusOp {
    #[must_use]
    pub fn has_rd(self) -> bool {
        matches!(self, BusOp::BusRd | BusOp::BusRdUpd)
    }

    #[must_use]
    pub fn has_upd(self) -> bool {
        matches!(self, BusOp::BusUpd | BusOp::BusRdUpd)
    }

    #[must_use]
    pub fn invalidates(self) -> bool {
        self == BusOp::BusRdX
    }
}

#[cfg(test)]
mod tests {
    use super::{BusOp, Packet};

    #[test]
    fn response_round_trip() {
        let mut pkt = Packet::read(0x8004, 4);
        assert!(pkt.is_read());
        assert!(pkt.needs_response());
        pkt.make_response();
        assert!(pkt.is_response());
        assert!(pkt.is_read());
    }

    #[test]
    fn block_data_transfer() {
        let mut block = vec![0u8; 32];
        let pkt = Packet::write(0x8004, vec![0xaa, 0xbb]);
        pkt.write_data_to_block(&mut block);
        assert_eq!(&block[4..6], &[0xaa, 0xbb]);

        let mut read = Packet::read(0x8005, 1);
        read.set_data_from_block(&block);
        assert_eq!(read.data, vec![0xbb]);
    }

    #[test]
    fn whole_block_writes() {
        let pkt = Packet::write(0x8020, vec![1; 32]);
        assert!(pkt.covers_block(32));
        assert!(!pkt.covers_block(64));
        let partial = Packet::write(0x8024, vec![1; 4]);
        assert!(!partial.covers_block(32));
    }

    #[test]
    fn bus_op_components() {
        assert!(BusOp::BusRdUpd.has_rd() && BusOp::BusRdUpd.has_upd());
        assert!(BusOp::BusRd.has_rd() && !BusOp::BusRd.has_upd());
        assert!(!BusOp::BusRdX.has_rd() && BusOp::BusRdX.invalidates());
    }
}
