/// A byte window over fixed storage.
///
/// Bytes in front of the window are headroom for [`BufSimple::push`], bytes behind it are
/// tailroom for [`BufSimple::add`]. Reads consume from the front with [`BufSimple::pull`].
/// Every operation that would leave the storage bounds panics.
#[derive(Clone)]
pub struct BufSimple<const SIZE: usize> {
    storage: [u8; SIZE],
    head: usize,
    len: usize,
}

/// Saved window position, see [`BufSimple::save`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BufState {
    head: usize,
    len: usize,
}

impl<const SIZE: usize> Default for BufSimple<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize> BufSimple<SIZE> {
    pub const fn new() -> Self {
        Self {
            storage: [0; SIZE],
            head: 0,
            len: 0,
        }
    }

    pub fn with_data(data: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.add_mem(data);
        buf
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Move an empty window forward, leaving `headroom` bytes for later pushes.
    pub fn reserve(&mut self, headroom: usize) {
        assert!(self.len == 0, "reserve on non-empty buffer");
        assert!(headroom <= SIZE, "reserve beyond capacity");
        self.head = headroom;
    }

    pub const fn capacity(&self) -> usize {
        SIZE
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.storage[self.head..self.head + self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.head..self.head + self.len]
    }

    pub fn headroom(&self) -> usize {
        self.head
    }

    pub fn tailroom(&self) -> usize {
        SIZE - self.head - self.len
    }

    /// Unused storage behind the window.
    pub fn tail_mut(&mut self) -> &mut [u8] {
        let end = self.head + self.len;
        &mut self.storage[end..]
    }

    pub fn save(&self) -> BufState {
        BufState {
            head: self.head,
            len: self.len,
        }
    }

    pub fn restore(&mut self, state: BufState) {
        self.head = state.head;
        self.len = state.len;
    }

    /// Grow the window at the back by `len` bytes and return them.
    pub fn add(&mut self, len: usize) -> &mut [u8] {
        assert!(
            self.tailroom() >= len,
            "add overflows buffer: {} > {}",
            len,
            self.tailroom()
        );
        let start = self.head + self.len;
        self.len += len;
        &mut self.storage[start..start + len]
    }

    pub fn add_mem(&mut self, mem: &[u8]) -> &mut [u8] {
        let dst = self.add(mem.len());
        dst.copy_from_slice(mem);
        dst
    }

    pub fn add_u8(&mut self, val: u8) {
        self.add(1)[0] = val;
    }

    pub fn add_le16(&mut self, val: u16) {
        self.add_mem(&val.to_le_bytes());
    }

    pub fn add_be16(&mut self, val: u16) {
        self.add_mem(&val.to_be_bytes());
    }

    pub fn add_le24(&mut self, val: u32) {
        self.add_mem(&val.to_le_bytes()[..3]);
    }

    pub fn add_le32(&mut self, val: u32) {
        self.add_mem(&val.to_le_bytes());
    }

    pub fn add_be32(&mut self, val: u32) {
        self.add_mem(&val.to_be_bytes());
    }

    pub fn add_le64(&mut self, val: u64) {
        self.add_mem(&val.to_le_bytes());
    }

    /// Grow the window at the front by `len` bytes and return them.
    pub fn push(&mut self, len: usize) -> &mut [u8] {
        assert!(
            self.head >= len,
            "push underflows buffer: {} > {}",
            len,
            self.head
        );
        self.head -= len;
        self.len += len;
        &mut self.storage[self.head..self.head + len]
    }

    pub fn push_mem(&mut self, mem: &[u8]) {
        self.push(mem.len()).copy_from_slice(mem);
    }

    pub fn push_u8(&mut self, val: u8) {
        self.push(1)[0] = val;
    }

    pub fn push_le16(&mut self, val: u16) {
        self.push_mem(&val.to_le_bytes());
    }

    pub fn push_be16(&mut self, val: u16) {
        self.push_mem(&val.to_be_bytes());
    }

    pub fn push_be24(&mut self, val: u32) {
        self.push_mem(&val.to_be_bytes()[1..]);
    }

    /// Shrink the window at the front by `len` bytes and return them.
    pub fn pull_mem(&mut self, len: usize) -> &[u8] {
        assert!(
            self.len >= len,
            "pull beyond data: {} > {}",
            len,
            self.len
        );
        let start = self.head;
        self.head += len;
        self.len -= len;
        &self.storage[start..start + len]
    }

    pub fn pull(&mut self, len: usize) {
        self.pull_mem(len);
    }

    fn pull_array<const L: usize>(&mut self) -> [u8; L] {
        let mut out = [0; L];
        out.copy_from_slice(self.pull_mem(L));
        out
    }

    pub fn pull_u8(&mut self) -> u8 {
        self.pull_mem(1)[0]
    }

    pub fn pull_le16(&mut self) -> u16 {
        u16::from_le_bytes(self.pull_array())
    }

    pub fn pull_be16(&mut self) -> u16 {
        u16::from_be_bytes(self.pull_array())
    }

    pub fn pull_le24(&mut self) -> u32 {
        let [a, b, c] = self.pull_array();
        u32::from_le_bytes([a, b, c, 0])
    }

    pub fn pull_le32(&mut self) -> u32 {
        u32::from_le_bytes(self.pull_array())
    }

    pub fn pull_be32(&mut self) -> u32 {
        u32::from_be_bytes(self.pull_array())
    }

    pub fn pull_le64(&mut self) -> u64 {
        u64::from_le_bytes(self.pull_array())
    }
}
