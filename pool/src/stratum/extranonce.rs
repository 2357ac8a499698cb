use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out connection-unique extraNonce1 values.
///
/// The top five bits carry the pool instance id so that several instances
/// behind one daemon never hand out overlapping nonce space.
#[derive(Debug)]
pub struct ExtraNonceProvider {
    instance_id: u32,
    counter: AtomicU32,
}

impl ExtraNonceProvider {
    /// extraNonce1 width in bytes.
    pub const SIZE: usize = 4;
    const ID_BITS: u32 = 5;
    const COUNTER_BITS: u32 = (Self::SIZE as u32) * 8 - Self::ID_BITS;
    const COUNTER_MASK: u32 = (1 << Self::COUNTER_BITS) - 1;

    pub fn new(instance_id: u8) -> Self {
        Self {
            instance_id: u32::from(instance_id) & ((1 << Self::ID_BITS) - 1),
            counter: AtomicU32::new(0),
        }
    }

    pub fn instance_id(&self) -> u8 {
        self.instance_id as u8
    }

    pub fn next(&self) -> [u8; Self::SIZE] {
        let n = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & Self::COUNTER_MASK;
        let value = (self.instance_id << Self::COUNTER_BITS) | n;
        value.to_be_bytes()
    }
}
