//! File records and the fixed-capacity table that holds them.

/// Longest accepted file name, in bytes. The on-disk field is one byte
/// wider so a stored name is always NUL-terminated.
pub const MAX_NAME_LEN: usize = 63;
const NAME_FIELD: usize = 64;

pub const DIRECT_SLOTS: usize = 4;
pub const INDIRECT_SLOTS: usize = 2;
/// Total pointer budget per file. The "indirect" slots are plain extra
/// pointers, not a second level of indirection, so this also caps the
/// maximum file size at `POINTER_SLOTS * block_size` bytes.
pub const POINTER_SLOTS: usize = DIRECT_SLOTS + INDIRECT_SLOTS;

/// Bytes of one table record on disk.
pub const INODE_DISK_SIZE: usize = 128;

/// On-disk encoding of an empty pointer slot. The data region is always far
/// smaller than `u32::MAX` blocks, so the value cannot collide with a real
/// block index.
const NO_BLOCK: u32 = u32::MAX;

/// One file record: a name, a creation timestamp, the byte size, and the
/// block pointers addressing the content. A slot holding `None` is unused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub name: String,
    /// Creation time, seconds since the Unix epoch.
    pub created: u64,
    pub size: u64,
    pub active: bool,
    pub direct: [Option<u32>; DIRECT_SLOTS],
    pub indirect: [Option<u32>; INDIRECT_SLOTS],
}

impl Inode {
    fn empty() -> Inode {
        Inode {
            name: String::new(),
            created: 0,
            size: 0,
            active: false,
            direct: [None; DIRECT_SLOTS],
            indirect: [None; INDIRECT_SLOTS],
        }
    }

    /// In-use pointers, direct slots first, in slot order.
    pub fn pointers(&self) -> impl Iterator<Item = u32> + '_ {
        self.direct
            .iter()
            .chain(self.indirect.iter())
            .flatten()
            .copied()
    }

    /// Spread `blocks` across the direct slots first, then the indirect
    /// slots. The caller must stay within the pointer budget.
    pub fn assign_pointers(&mut self, blocks: &[u32]) {
        assert!(blocks.len() <= POINTER_SLOTS, "pointer budget exceeded");
        self.clear_pointers();
        for (i, &block) in blocks.iter().enumerate() {
            if i < DIRECT_SLOTS {
                self.direct[i] = Some(block);
            } else {
                self.indirect[i - DIRECT_SLOTS] = Some(block);
            }
        }
    }

    pub fn clear_pointers(&mut self) {
        self.direct = [None; DIRECT_SLOTS];
        self.indirect = [None; INDIRECT_SLOTS];
    }

    pub fn to_bytes(&self) -> [u8; INODE_DISK_SIZE] {
        let mut bytes = [0u8; INODE_DISK_SIZE];
        let name = self.name.as_bytes();
        debug_assert!(name.len() <= MAX_NAME_LEN, "name exceeds the field width");
        bytes[..name.len()].copy_from_slice(name);
        bytes[64..72].copy_from_slice(&self.created.to_le_bytes());
        bytes[72..80].copy_from_slice(&self.size.to_le_bytes());
        bytes[80] = self.active as u8;
        let mut offset = 81;
        for slot in self.direct.iter().chain(self.indirect.iter()) {
            let word = slot.unwrap_or(NO_BLOCK);
            bytes[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
            offset += 4;
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Inode {
        let name_end = bytes[..NAME_FIELD]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_FIELD);
        let name = String::from_utf8_lossy(&bytes[..name_end]).into_owned();
        let created = u64::from_le_bytes(bytes[64..72].try_into().unwrap());
        let size = u64::from_le_bytes(bytes[72..80].try_into().unwrap());
        let active = bytes[80] != 0;
        let mut slots = [None; POINTER_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            let offset = 81 + i * 4;
            let word = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
            if word != NO_BLOCK {
                *slot = Some(word);
            }
        }
        let mut direct = [None; DIRECT_SLOTS];
        let mut indirect = [None; INDIRECT_SLOTS];
        direct.copy_from_slice(&slots[..DIRECT_SLOTS]);
        indirect.copy_from_slice(&slots[DIRECT_SLOTS..]);
        Inode {
            name,
            created,
            size,
            active,
            direct,
            indirect,
        }
    }
}

/// The flat file table. Capacity is fixed when the filesystem is formatted;
/// entries are addressed by table index and slots are reused after deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeTable {
    inodes: Vec<Inode>,
}

impl InodeTable {
    pub fn new(max_inodes: usize) -> InodeTable {
        InodeTable {
            inodes: vec![Inode::empty(); max_inodes],
        }
    }

    pub fn capacity(&self) -> usize {
        self.inodes.len()
    }

    pub fn get(&self, index: usize) -> &Inode {
        &self.inodes[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Inode {
        &mut self.inodes[index]
    }

    /// Index of the active entry named `name`. Scans the whole capacity
    /// range: active entries are not contiguous once slots get reused.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.inodes
            .iter()
            .position(|inode| inode.active && inode.name == name)
    }

    /// First inactive slot, again over the whole capacity range.
    pub fn find_free_slot(&self) -> Option<usize> {
        self.inodes.iter().position(|inode| !inode.active)
    }

    /// Active entries in table-index order.
    pub fn active_entries(&self) -> impl Iterator<Item = (usize, &Inode)> {
        self.inodes
            .iter()
            .enumerate()
            .filter(|(_, inode)| inode.active)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.inodes.len() * INODE_DISK_SIZE);
        for inode in &self.inodes {
            bytes.extend_from_slice(&inode.to_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8], max_inodes: usize) -> InodeTable {
        let inodes = (0..max_inodes)
            .map(|i| Inode::from_bytes(&bytes[i * INODE_DISK_SIZE..(i + 1) * INODE_DISK_SIZE]))
            .collect();
        InodeTable { inodes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inode() -> Inode {
        let mut inode = Inode::empty();
        inode.name = "notes.txt".to_string();
        inode.created = 1_700_000_000;
        inode.size = 2600;
        inode.active = true;
        inode.assign_pointers(&[7, 8, 9, 10, 11]);
        inode
    }

    #[test]
    fn record_codec_round_trips() {
        let inode = sample_inode();
        let bytes = inode.to_bytes();
        assert_eq!(bytes.len(), INODE_DISK_SIZE);
        assert_eq!(Inode::from_bytes(&bytes), inode);
    }

    #[test]
    fn empty_record_has_no_pointers() {
        let bytes = Inode::empty().to_bytes();
        let inode = Inode::from_bytes(&bytes);
        assert!(!inode.active);
        assert!(inode.pointers().next().is_none());
        // an empty slot is encoded as u32::MAX, never as a real index
        assert_eq!(&bytes[81..85], &u32::MAX.to_le_bytes());
    }

    #[test]
    fn name_field_is_nul_terminated() {
        let bytes = sample_inode().to_bytes();
        assert_eq!(&bytes[..9], b"notes.txt");
        assert_eq!(bytes[9], 0);
    }

    #[test]
    fn pointers_fill_direct_slots_before_indirect() {
        let inode = sample_inode();
        assert_eq!(inode.direct, [Some(7), Some(8), Some(9), Some(10)]);
        assert_eq!(inode.indirect, [Some(11), None]);
        assert_eq!(inode.pointers().collect::<Vec<_>>(), vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn slot_zero_counts_as_in_use() {
        let mut inode = Inode::empty();
        inode.assign_pointers(&[0]);
        assert_eq!(inode.pointers().collect::<Vec<_>>(), vec![0]);
        let decoded = Inode::from_bytes(&inode.to_bytes());
        assert_eq!(decoded.direct[0], Some(0));
    }

    #[test]
    fn lookup_scans_past_inactive_slots() {
        let mut table = InodeTable::new(4);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let inode = table.get_mut(i);
            inode.name = name.to_string();
            inode.active = true;
        }
        table.get_mut(1).active = false;
        assert_eq!(table.lookup("c"), Some(2));
        assert_eq!(table.lookup("b"), None);
        assert_eq!(table.find_free_slot(), Some(1));
    }

    #[test]
    fn table_codec_round_trips() {
        let mut table = InodeTable::new(3);
        *table.get_mut(1) = sample_inode();
        let bytes = table.to_bytes();
        assert_eq!(bytes.len(), 3 * INODE_DISK_SIZE);
        assert_eq!(InodeTable::from_bytes(&bytes, 3), table);
    }
}
