//! In-memory [`FileStore`] used by the test suites.
//!
//! Models a small FAT volume: a tree of named directories and files with
//! case-insensitive lookups, per-file read-only flags and a fake free-space
//! figure. Not a FAT implementation; just enough behaviour for the engine
//! to run against.

use std::collections::HashMap;

use crate::storage::{
    DirHandle, DirId, FatEntry, FileId, FileStore, FsError, MediaState, OpenMode,
};

#[derive(Debug)]
enum Node {
    Dir {
        parent: DirId,
        name: String,
        /// Child node ids in creation order, like a FAT directory.
        children: Vec<u32>,
    },
    File {
        name: String,
        data: Vec<u8>,
        read_only: bool,
    },
}

struct OpenFile {
    node: u32,
    pos: u64,
    writable: bool,
}

/// In-memory file store.
pub struct MemStore {
    nodes: HashMap<u32, Node>,
    next_node: u32,
    open_files: HashMap<FileId, OpenFile>,
    next_file: FileId,
    dir_iters: HashMap<DirHandle, (DirId, usize)>,
    next_iter: DirHandle,
    label: String,
    free_space: u64,
    media: MediaState,
}

fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl MemStore {
    /// Create an empty volume with the given label.
    #[must_use]
    pub fn new(label: &str) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            0,
            Node::Dir {
                parent: 0,
                name: String::new(),
                children: Vec::new(),
            },
        );
        Self {
            nodes,
            next_node: 1,
            open_files: HashMap::new(),
            next_file: 1,
            dir_iters: HashMap::new(),
            next_iter: 1,
            label: label.to_owned(),
            free_space: 16 * 1024 * 1024,
            media: MediaState::Ok,
        }
    }

    /// Create a file with the given contents, replacing any existing one.
    pub fn add_file(&mut self, dir: DirId, name: &str, data: &[u8]) {
        let _ = self.remove(dir, name);
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.insert(
            id,
            Node::File {
                name: name.to_owned(),
                data: data.to_vec(),
                read_only: false,
            },
        );
        if let Some(Node::Dir { children, .. }) = self.nodes.get_mut(&dir) {
            children.push(id);
        }
    }

    /// Mark an existing file read-only.
    pub fn set_read_only(&mut self, dir: DirId, name: &str, ro: bool) {
        if let Some(id) = self.lookup(dir, name) {
            if let Some(Node::File { read_only, .. }) = self.nodes.get_mut(&id) {
                *read_only = ro;
            }
        }
    }

    /// Contents of a file, if it exists.
    #[must_use]
    pub fn file_data(&self, dir: DirId, name: &str) -> Option<&[u8]> {
        let id = self.lookup(dir, name)?;
        match self.nodes.get(&id) {
            Some(Node::File { data, .. }) => Some(data),
            _ => None,
        }
    }

    /// Simulate a media change; the next `media_state` poll reports it.
    pub fn set_media_changed(&mut self) {
        self.media = MediaState::Changed;
    }

    /// Override the reported free space.
    pub fn set_free_space(&mut self, bytes: u64) {
        self.free_space = bytes;
    }

    fn lookup(&self, dir: DirId, name: &str) -> Option<u32> {
        let Node::Dir { children, .. } = self.nodes.get(&dir)? else {
            return None;
        };
        children
            .iter()
            .copied()
            .find(|id| names_equal(self.node_name(*id), name))
    }

    fn node_name(&self, id: u32) -> &str {
        match &self.nodes[&id] {
            Node::Dir { name, .. } | Node::File { name, .. } => name,
        }
    }

    fn entry_of(&self, id: u32) -> FatEntry {
        match &self.nodes[&id] {
            Node::Dir { name, .. } => FatEntry {
                name: name.clone(),
                size: 0,
                is_dir: true,
                read_only: false,
            },
            Node::File {
                name,
                data,
                read_only,
            } => FatEntry {
                name: name.clone(),
                size: data.len() as u64,
                is_dir: false,
                read_only: *read_only,
            },
        }
    }
}

impl FileStore for MemStore {
    fn open(&mut self, dir: DirId, name: &str, mode: OpenMode) -> Result<FileId, FsError> {
        let existing = self.lookup(dir, name);
        let node = match mode {
            OpenMode::Read | OpenMode::ReadWrite | OpenMode::Append => {
                let id = existing.ok_or(FsError::NotFound)?;
                match self.nodes.get(&id) {
                    Some(Node::File { read_only, .. }) => {
                        if *read_only && mode != OpenMode::Read {
                            return Err(FsError::WriteProtected);
                        }
                        id
                    }
                    _ => return Err(FsError::NotDirectory),
                }
            }
            OpenMode::Write => {
                if let Some(id) = existing {
                    match self.nodes.get_mut(&id) {
                        Some(Node::File {
                            data, read_only, ..
                        }) => {
                            if *read_only {
                                return Err(FsError::WriteProtected);
                            }
                            data.clear();
                            id
                        }
                        _ => return Err(FsError::NotDirectory),
                    }
                } else {
                    let id = self.next_node;
                    self.next_node += 1;
                    self.nodes.insert(
                        id,
                        Node::File {
                            name: name.to_owned(),
                            data: Vec::new(),
                            read_only: false,
                        },
                    );
                    match self.nodes.get_mut(&dir) {
                        Some(Node::Dir { children, .. }) => children.push(id),
                        _ => return Err(FsError::NotDirectory),
                    }
                    id
                }
            }
        };

        let pos = if mode == OpenMode::Append {
            match &self.nodes[&node] {
                Node::File { data, .. } => data.len() as u64,
                Node::Dir { .. } => 0,
            }
        } else {
            0
        };

        let handle = self.next_file;
        self.next_file += 1;
        self.open_files.insert(
            handle,
            OpenFile {
                node,
                pos,
                writable: mode != OpenMode::Read,
            },
        );
        Ok(handle)
    }

    fn read(&mut self, file: FileId, buf: &mut [u8]) -> Result<usize, FsError> {
        let of = self.open_files.get_mut(&file).ok_or(FsError::InvalidHandle)?;
        let Node::File { data, .. } = &self.nodes[&of.node] else {
            return Err(FsError::Io);
        };
        let start = usize::try_from(of.pos).map_err(|_| FsError::Io)?;
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        of.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, file: FileId, buf: &[u8]) -> Result<usize, FsError> {
        let of = self.open_files.get_mut(&file).ok_or(FsError::InvalidHandle)?;
        if !of.writable {
            return Err(FsError::WriteProtected);
        }
        let Some(Node::File { data, .. }) = self.nodes.get_mut(&of.node) else {
            return Err(FsError::Io);
        };
        let start = usize::try_from(of.pos).map_err(|_| FsError::Io)?;
        if data.len() < start {
            data.resize(start, 0);
        }
        let overlap = (data.len() - start).min(buf.len());
        data[start..start + overlap].copy_from_slice(&buf[..overlap]);
        data.extend_from_slice(&buf[overlap..]);
        of.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn seek(&mut self, file: FileId, pos: u64) -> Result<(), FsError> {
        let of = self.open_files.get_mut(&file).ok_or(FsError::InvalidHandle)?;
        of.pos = pos;
        Ok(())
    }

    fn tell(&mut self, file: FileId) -> Result<u64, FsError> {
        let of = self.open_files.get(&file).ok_or(FsError::InvalidHandle)?;
        Ok(of.pos)
    }

    fn size(&mut self, file: FileId) -> Result<u64, FsError> {
        let of = self.open_files.get(&file).ok_or(FsError::InvalidHandle)?;
        match &self.nodes[&of.node] {
            Node::File { data, .. } => Ok(data.len() as u64),
            Node::Dir { .. } => Err(FsError::Io),
        }
    }

    fn close(&mut self, file: FileId) -> Result<(), FsError> {
        self.open_files
            .remove(&file)
            .map(|_| ())
            .ok_or(FsError::InvalidHandle)
    }

    fn open_dir(&mut self, dir: DirId) -> Result<DirHandle, FsError> {
        match self.nodes.get(&dir) {
            Some(Node::Dir { .. }) => {
                let h = self.next_iter;
                self.next_iter += 1;
                self.dir_iters.insert(h, (dir, 0));
                Ok(h)
            }
            _ => Err(FsError::NotDirectory),
        }
    }

    fn read_dir(&mut self, handle: DirHandle) -> Result<Option<FatEntry>, FsError> {
        let (dir, index) = *self.dir_iters.get(&handle).ok_or(FsError::InvalidHandle)?;
        let Node::Dir { children, .. } = &self.nodes[&dir] else {
            return Err(FsError::Io);
        };
        let Some(&child) = children.get(index) else {
            return Ok(None);
        };
        let entry = self.entry_of(child);
        if let Some(it) = self.dir_iters.get_mut(&handle) {
            it.1 += 1;
        }
        Ok(Some(entry))
    }

    fn stat(&mut self, dir: DirId, name: &str) -> Result<FatEntry, FsError> {
        let id = self.lookup(dir, name).ok_or(FsError::NotFound)?;
        Ok(self.entry_of(id))
    }

    fn subdir(&mut self, dir: DirId, name: &str) -> Result<DirId, FsError> {
        let id = self.lookup(dir, name).ok_or(FsError::NotFound)?;
        match self.nodes.get(&id) {
            Some(Node::Dir { .. }) => Ok(id),
            _ => Err(FsError::NotDirectory),
        }
    }

    fn parent(&mut self, dir: DirId) -> Result<DirId, FsError> {
        match self.nodes.get(&dir) {
            Some(Node::Dir { parent, .. }) => Ok(*parent),
            _ => Err(FsError::NotDirectory),
        }
    }

    fn mkdir(&mut self, dir: DirId, name: &str) -> Result<(), FsError> {
        if self.lookup(dir, name).is_some() {
            return Err(FsError::Exists);
        }
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.insert(
            id,
            Node::Dir {
                parent: dir,
                name: name.to_owned(),
                children: Vec::new(),
            },
        );
        match self.nodes.get_mut(&dir) {
            Some(Node::Dir { children, .. }) => {
                children.push(id);
                Ok(())
            }
            _ => Err(FsError::NotDirectory),
        }
    }

    fn rmdir(&mut self, dir: DirId, name: &str) -> Result<(), FsError> {
        let id = self.lookup(dir, name).ok_or(FsError::NotFound)?;
        match self.nodes.get(&id) {
            Some(Node::Dir { children, .. }) => {
                if !children.is_empty() {
                    return Err(FsError::DirNotEmpty);
                }
            }
            _ => return Err(FsError::NotDirectory),
        }
        self.nodes.remove(&id);
        if let Some(Node::Dir { children, .. }) = self.nodes.get_mut(&dir) {
            children.retain(|c| *c != id);
        }
        Ok(())
    }

    fn remove(&mut self, dir: DirId, name: &str) -> Result<(), FsError> {
        let id = self.lookup(dir, name).ok_or(FsError::NotFound)?;
        match self.nodes.get(&id) {
            Some(Node::File { read_only, .. }) => {
                if *read_only {
                    return Err(FsError::WriteProtected);
                }
            }
            _ => return Err(FsError::NotDirectory),
        }
        self.nodes.remove(&id);
        if let Some(Node::Dir { children, .. }) = self.nodes.get_mut(&dir) {
            children.retain(|c| *c != id);
        }
        Ok(())
    }

    fn rename(&mut self, dir: DirId, old: &str, new: &str) -> Result<(), FsError> {
        if self.lookup(dir, new).is_some() {
            return Err(FsError::Exists);
        }
        let id = self.lookup(dir, old).ok_or(FsError::NotFound)?;
        match self.nodes.get_mut(&id) {
            Some(Node::Dir { name, .. } | Node::File { name, .. }) => {
                *name = new.to_owned();
                Ok(())
            }
            None => Err(FsError::NotFound),
        }
    }

    fn free_space(&mut self) -> Result<u64, FsError> {
        Ok(self.free_space)
    }

    fn volume_label(&mut self) -> Result<String, FsError> {
        Ok(self.label.clone())
    }

    fn dir_name(&mut self, dir: DirId) -> Result<String, FsError> {
        match self.nodes.get(&dir) {
            Some(Node::Dir { name, .. }) => Ok(name.clone()),
            _ => Err(FsError::NotDirectory),
        }
    }

    fn media_state(&mut self) -> MediaState {
        let state = self.media;
        self.media = MediaState::Ok;
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_round_trip() {
        let mut fs = MemStore::new("TEST");
        let f = fs.open(0, "hello.prg", OpenMode::Write).expect("open");
        fs.write(f, b"abc").expect("write");
        fs.close(f).expect("close");

        let f = fs.open(0, "HELLO.PRG", OpenMode::Read).expect("reopen");
        let mut buf = [0u8; 8];
        let n = fs.read(f, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(fs.read(f, &mut buf).expect("eof"), 0);
    }

    #[test]
    fn write_truncates_existing() {
        let mut fs = MemStore::new("TEST");
        fs.add_file(0, "A", b"long contents");
        let f = fs.open(0, "a", OpenMode::Write).expect("open");
        fs.write(f, b"x").expect("write");
        fs.close(f).expect("close");
        assert_eq!(fs.file_data(0, "A").expect("data"), b"x");
    }

    #[test]
    fn append_positions_at_end() {
        let mut fs = MemStore::new("TEST");
        fs.add_file(0, "A", b"ab");
        let f = fs.open(0, "A", OpenMode::Append).expect("open");
        fs.write(f, b"cd").expect("write");
        fs.close(f).expect("close");
        assert_eq!(fs.file_data(0, "A").expect("data"), b"abcd");
    }

    #[test]
    fn directory_enumeration_in_creation_order() {
        let mut fs = MemStore::new("TEST");
        fs.add_file(0, "ONE", b"1");
        fs.mkdir(0, "SUB").expect("mkdir");
        fs.add_file(0, "TWO", b"2");

        let h = fs.open_dir(0).expect("open_dir");
        let names: Vec<String> = std::iter::from_fn(|| fs.read_dir(h).expect("read_dir"))
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["ONE", "SUB", "TWO"]);
    }

    #[test]
    fn rmdir_refuses_nonempty() {
        let mut fs = MemStore::new("TEST");
        fs.mkdir(0, "SUB").expect("mkdir");
        let sub = fs.subdir(0, "SUB").expect("subdir");
        fs.add_file(sub, "F", b"x");
        assert_eq!(fs.rmdir(0, "SUB"), Err(FsError::DirNotEmpty));
        fs.remove(sub, "F").expect("remove");
        fs.rmdir(0, "SUB").expect("rmdir");
    }

    #[test]
    fn read_only_blocks_writes() {
        let mut fs = MemStore::new("TEST");
        fs.add_file(0, "LOCKED", b"x");
        fs.set_read_only(0, "LOCKED", true);
        assert_eq!(fs.open(0, "LOCKED", OpenMode::Write), Err(FsError::WriteProtected));
        assert_eq!(fs.remove(0, "LOCKED"), Err(FsError::WriteProtected));
        assert!(fs.open(0, "LOCKED", OpenMode::Read).is_ok());
    }

    #[test]
    fn sparse_seek_write_zero_fills() {
        let mut fs = MemStore::new("TEST");
        let f = fs.open(0, "S", OpenMode::Write).expect("open");
        fs.seek(f, 4).expect("seek");
        fs.write(f, b"z").expect("write");
        fs.close(f).expect("close");
        assert_eq!(fs.file_data(0, "S").expect("data"), &[0, 0, 0, 0, b'z']);
    }

    #[test]
    fn media_change_reported_once() {
        let mut fs = MemStore::new("TEST");
        assert_eq!(fs.media_state(), MediaState::Ok);
        fs.set_media_changed();
        assert_eq!(fs.media_state(), MediaState::Changed);
        assert_eq!(fs.media_state(), MediaState::Ok);
    }
}
