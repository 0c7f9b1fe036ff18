use anyhow::bail;

/// A fixed-capacity circular queue of packet ids, oldest first.
///
/// Backs the engine's send-order bookkeeping: an id enters when its packet goes
///  on the wire and leaves when the response is released to the caller. Id 0 is
///  rejected, it is reserved for status packets.
pub struct IdQueue {
    slots: Box<[u16]>,
    head: usize,
    len: usize,
}

impl IdQueue {
    pub fn new(capacity: usize) -> IdQueue {
        IdQueue {
            slots: vec![0; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    /// A rejected push leaves the queue untouched.
    pub fn push(&mut self, packet_id: u16) -> anyhow::Result<()> {
        if packet_id == 0 {
            bail!("packet id 0 is reserved for status packets");
        }
        if self.is_full() {
            bail!("id queue is full ({} ids)", self.slots.len());
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = packet_id;
        self.len += 1;
        Ok(())
    }

    pub fn pop_oldest(&mut self) -> Option<u16> {
        if self.len == 0 {
            return None;
        }
        let packet_id = self.slots[self.head];
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        Some(packet_id)
    }

    pub fn oldest(&self) -> Option<u16> {
        (self.len > 0).then(|| self.slots[self.head])
    }

    pub fn newest(&self) -> Option<u16> {
        (self.len > 0).then(|| self.slots[(self.head + self.len - 1) % self.slots.len()])
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.len).map(move |i| self.slots[(self.head + i) % self.slots.len()])
    }
}
