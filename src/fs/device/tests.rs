use super::*;
use crate::blockstore::inmemory::InMemoryBlockStore;
use crate::blockstore::parallel::ParallelAccessBlockStore;
use crate::error::FsError;

const UID: u32 = 1000;
const GID: u32 = 1000;

fn device() -> Device<InMemoryBlockStore> {
    let store = ParallelAccessBlockStore::new(InMemoryBlockStore::new());
    let fsblobstore = ParallelAccessFsBlobStore::new(store, 32832).unwrap();
    Device::new(
        fsblobstore,
        None,
        32832,
        AtimeUpdateBehavior::Relatime,
        UID,
        GID,
    )
    .unwrap()
}

fn path(s: &str) -> &Path {
    Path::new(s)
}

fn write_file(device: &Device<InMemoryBlockStore>, p: &str, content: &[u8]) {
    let fd = device
        .create_and_open_file(path(p), 0o644, UID, GID)
        .unwrap();
    device.write(fd, content, 0).unwrap();
    device.release(fd).unwrap();
}

fn read_file(device: &Device<InMemoryBlockStore>, p: &str) -> Vec<u8> {
    let fd = device.open(path(p)).unwrap();
    let size = device.getattr(path(p)).unwrap().size;
    let mut buffer = vec![0; size as usize];
    let read = device.read(fd, &mut buffer, 0).unwrap();
    assert_eq!(read, buffer.len());
    device.release(fd).unwrap();
    buffer
}

fn names(entries: &[crate::fsblobstore::DirEntry]) -> Vec<&str> {
    let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    names.sort();
    names
}

#[test]
fn root_stat() {
    let device = device();
    let attrs = device.getattr(path("/")).unwrap();
    assert_eq!(attrs.node_type, BlobType::Dir);
    assert_eq!(attrs.uid, UID);
    assert_eq!(attrs.mode & libc::S_IFMT as u32, libc::S_IFDIR as u32);
}

#[test]
fn root_dir_is_its_own_parent() {
    let device = device();
    let root_id = device.root_blob_id();
    let mut root = device.fsblobstore.load(&root_id).unwrap().unwrap();
    assert_eq!(root.parent(), root_id);
}

#[test]
fn create_write_read() {
    let device = device();
    write_file(&device, "/hello.txt", b"hello world");
    assert_eq!(read_file(&device, "/hello.txt"), b"hello world");

    let attrs = device.getattr(path("/hello.txt")).unwrap();
    assert_eq!(attrs.size, 11);
    assert_eq!(attrs.node_type, BlobType::File);
    assert_eq!(attrs.uid, UID);
}

#[test]
fn large_file_roundtrip() {
    let device = device();
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    write_file(&device, "/big", &content);
    assert_eq!(read_file(&device, "/big"), content);
}

#[test]
fn nested_directories() {
    let device = device();
    device.mkdir(path("/a"), 0o755, UID, GID).unwrap();
    device.mkdir(path("/a/b"), 0o755, UID, GID).unwrap();
    write_file(&device, "/a/b/file", b"nested");
    assert_eq!(read_file(&device, "/a/b/file"), b"nested");

    let entries = device.readdir(path("/a")).unwrap();
    assert_eq!(names(&entries), vec!["b"]);
    assert_eq!(device.getattr(path("/a/b")).unwrap().node_type, BlobType::Dir);
}

#[test]
fn lookup_of_missing_path_is_not_found() {
    let device = device();
    assert!(matches!(
        device.getattr(path("/missing")).unwrap_err(),
        Error::Fs(FsError::NotFound)
    ));
    assert!(matches!(
        device.open(path("/missing/deeper")).unwrap_err(),
        Error::Fs(FsError::NotFound)
    ));
}

#[test]
fn create_in_file_parent_fails() {
    let device = device();
    write_file(&device, "/file", b"x");
    assert!(matches!(
        device.mkdir(path("/file/sub"), 0o755, UID, GID).unwrap_err(),
        Error::Fs(FsError::NotADirectory)
    ));
}

#[test]
fn duplicate_name_fails_and_leaves_no_orphan() {
    let device = device();
    write_file(&device, "/name", b"first");
    let blocks_before = device.fsblobstore.num_blocks().unwrap();
    assert!(matches!(
        device
            .create_and_open_file(path("/name"), 0o644, UID, GID)
            .unwrap_err(),
        Error::Fs(FsError::AlreadyExists)
    ));
    assert_eq!(device.fsblobstore.num_blocks().unwrap(), blocks_before);
    assert_eq!(read_file(&device, "/name"), b"first");
}

#[test]
fn unlink_removes_file_and_blocks() {
    let device = device();
    write_file(&device, "/doomed", &[1u8; 100_000]);
    assert!(device.fsblobstore.num_blocks().unwrap() > 1);
    device.unlink(path("/doomed")).unwrap();
    assert!(matches!(
        device.getattr(path("/doomed")).unwrap_err(),
        Error::Fs(FsError::NotFound)
    ));
    // Only the root dir blob remains.
    assert_eq!(device.fsblobstore.num_blocks().unwrap(), 1);
}

#[test]
fn unlink_of_dir_fails() {
    let device = device();
    device.mkdir(path("/dir"), 0o755, UID, GID).unwrap();
    assert!(matches!(
        device.unlink(path("/dir")).unwrap_err(),
        Error::Fs(FsError::IsADirectory)
    ));
}

#[test]
fn rmdir_requires_empty_dir() {
    let device = device();
    device.mkdir(path("/dir"), 0o755, UID, GID).unwrap();
    write_file(&device, "/dir/file", b"x");
    assert!(matches!(
        device.rmdir(path("/dir")).unwrap_err(),
        Error::Fs(FsError::NotEmpty)
    ));
    device.unlink(path("/dir/file")).unwrap();
    device.rmdir(path("/dir")).unwrap();
    assert!(device.getattr(path("/dir")).is_err());
}

#[test]
fn rename_within_dir() {
    let device = device();
    write_file(&device, "/old", b"content");
    device.rename(path("/old"), path("/new")).unwrap();
    assert!(device.getattr(path("/old")).is_err());
    assert_eq!(read_file(&device, "/new"), b"content");
}

#[test]
fn rename_across_dirs_updates_parent_pointer() {
    let device = device();
    device.mkdir(path("/a"), 0o755, UID, GID).unwrap();
    device.mkdir(path("/b"), 0o755, UID, GID).unwrap();
    write_file(&device, "/a/file", b"moved");

    device.rename(path("/a/file"), path("/b/file2")).unwrap();

    assert!(names(&device.readdir(path("/a")).unwrap()).is_empty());
    assert_eq!(names(&device.readdir(path("/b")).unwrap()), vec!["file2"]);
    assert_eq!(read_file(&device, "/b/file2"), b"moved");

    // The moved blob's parent pointer follows the move.
    let b_id = device.getattr(path("/b")).unwrap().blob_id;
    let file_id = device.getattr(path("/b/file2")).unwrap().blob_id;
    let mut moved = device.fsblobstore.load(&file_id).unwrap().unwrap();
    assert_eq!(moved.parent(), b_id);
}

#[test]
fn rename_overwrites_compatible_target() {
    let device = device();
    write_file(&device, "/src", b"new content");
    write_file(&device, "/dst", b"old content");
    let blocks_before = device.fsblobstore.num_blocks().unwrap();
    device.rename(path("/src"), path("/dst")).unwrap();
    assert_eq!(read_file(&device, "/dst"), b"new content");
    assert!(device.getattr(path("/src")).is_err());
    // The overwritten blob was destroyed.
    assert_eq!(device.fsblobstore.num_blocks().unwrap(), blocks_before - 1);
}

#[test]
fn rename_rejects_nonempty_dir_target() {
    let device = device();
    device.mkdir(path("/src"), 0o755, UID, GID).unwrap();
    device.mkdir(path("/dst"), 0o755, UID, GID).unwrap();
    write_file(&device, "/dst/occupant", b"x");
    assert!(matches!(
        device.rename(path("/src"), path("/dst")).unwrap_err(),
        Error::Fs(FsError::NotEmpty)
    ));
}

#[test]
fn rename_rejects_dir_file_mismatch() {
    let device = device();
    device.mkdir(path("/dir"), 0o755, UID, GID).unwrap();
    write_file(&device, "/file", b"x");
    assert!(device.rename(path("/dir"), path("/file")).is_err());
    assert!(device.rename(path("/file"), path("/dir")).is_err());
}

#[test]
fn rename_into_own_subtree_is_rejected() {
    let device = device();
    device.mkdir(path("/dir"), 0o755, UID, GID).unwrap();
    assert!(matches!(
        device.rename(path("/dir"), path("/dir/sub")).unwrap_err(),
        Error::Fs(FsError::InvalidOperation)
    ));
}

#[test]
fn symlink_roundtrip() {
    let device = device();
    device
        .create_symlink("/some/target", path("/link"), UID, GID)
        .unwrap();
    assert_eq!(device.readlink(path("/link")).unwrap(), "/some/target");

    let attrs = device.getattr(path("/link")).unwrap();
    assert_eq!(attrs.node_type, BlobType::Symlink);
    assert_eq!(attrs.size, "/some/target".len() as u64);
    // Symlinks can be unlinked.
    device.unlink(path("/link")).unwrap();
    assert!(device.getattr(path("/link")).is_err());
}

#[test]
fn truncate_grows_and_shrinks() {
    let device = device();
    write_file(&device, "/file", b"0123456789");
    device.truncate(path("/file"), 4).unwrap();
    assert_eq!(read_file(&device, "/file"), b"0123");
    device.truncate(path("/file"), 8).unwrap();
    assert_eq!(read_file(&device, "/file"), b"0123\0\0\0\0");
}

#[test]
fn ftruncate_via_descriptor() {
    let device = device();
    let fd = device
        .create_and_open_file(path("/file"), 0o644, UID, GID)
        .unwrap();
    device.write(fd, b"0123456789", 0).unwrap();
    device.ftruncate(fd, 3).unwrap();
    let mut buffer = [0u8; 10];
    assert_eq!(device.read(fd, &mut buffer, 0).unwrap(), 3);
    device.release(fd).unwrap();
    assert!(device.read(fd, &mut buffer, 0).is_err());
}

#[test]
fn chmod_keeps_file_type() {
    let device = device();
    write_file(&device, "/file", b"x");
    device.chmod(path("/file"), 0o600).unwrap();
    let attrs = device.getattr(path("/file")).unwrap();
    assert_eq!(attrs.mode & 0o777, 0o600);
    assert_eq!(attrs.mode & libc::S_IFMT as u32, libc::S_IFREG as u32);
}

#[test]
fn chown_updates_entry() {
    let device = device();
    write_file(&device, "/file", b"x");
    device.chown(path("/file"), 123, u32::MAX).unwrap();
    let attrs = device.getattr(path("/file")).unwrap();
    assert_eq!(attrs.uid, 123);
    assert_eq!(attrs.gid, GID);
}

#[test]
fn utimens_sets_times() {
    let device = device();
    write_file(&device, "/file", b"x");
    let atime = Timespec { secs: 1_000, nanos: 1 };
    let mtime = Timespec { secs: 2_000, nanos: 2 };
    device.utimens(path("/file"), atime, mtime).unwrap();
    let attrs = device.getattr(path("/file")).unwrap();
    assert_eq!(attrs.last_access_time, atime);
    assert_eq!(attrs.last_modification_time, mtime);
}

#[test]
fn write_updates_mtime() {
    let device = device();
    write_file(&device, "/file", b"x");
    let before = device.getattr(path("/file")).unwrap().last_modification_time;
    std::thread::sleep(std::time::Duration::from_millis(20));
    let fd = device.open(path("/file")).unwrap();
    device.write(fd, b"y", 0).unwrap();
    device.release(fd).unwrap();
    let after = device.getattr(path("/file")).unwrap().last_modification_time;
    assert!(after > before);
}

#[test]
fn statfs_reports_usage() {
    let device = device();
    let before = device.statfs().unwrap();
    assert_eq!(before.num_used_blocks, 1);
    write_file(&device, "/big", &[0u8; 200_000]);
    let after = device.statfs().unwrap();
    assert!(after.num_used_blocks > before.num_used_blocks);
    assert!(after.block_size > 0);
}

#[test]
fn concurrent_access_to_different_files() {
    let device = Arc::new(device());
    write_file(&device, "/a", b"");
    write_file(&device, "/b", b"");

    let handles: Vec<_> = ["/a", "/b"]
        .into_iter()
        .map(|p| {
            let device = Arc::clone(&device);
            let p = p.to_string();
            std::thread::spawn(move || {
                for i in 0..20u8 {
                    let fd = device.open(path(&p)).unwrap();
                    device.write(fd, &[i; 512], i as u64 * 512).unwrap();
                    device.release(fd).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for p in ["/a", "/b"] {
        let content = read_file(&device, p);
        assert_eq!(content.len(), 20 * 512);
        for i in 0..20u8 {
            assert!(content[i as usize * 512..(i as usize + 1) * 512]
                .iter()
                .all(|&b| b == i));
        }
    }
}
