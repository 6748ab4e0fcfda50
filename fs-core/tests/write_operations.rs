use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom, Write};

use pebblefs::{Config, Error, FileBackedBlockDevice, Filesystem, OpenFlags, RamBlockDevice};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// Helper function to create a freshly formatted filesystem
fn setup_test_fs(blocks: u64, config: Config) -> (RamBlockDevice, Filesystem<RamBlockDevice>) {
    env_logger::builder().is_test(true).try_init().ok();

    let mut dev = RamBlockDevice::new(1, 1, 512, blocks);
    Filesystem::format(&mut dev, &config).unwrap();
    let fs = Filesystem::mount(dev.clone(), config).unwrap();
    (dev, fs)
}

fn remount(dev: &RamBlockDevice, fs: Filesystem<RamBlockDevice>) -> Filesystem<RamBlockDevice> {
    let config = fs.config().clone();
    fs.unmount().unwrap();
    Filesystem::mount(dev.clone(), config).unwrap()
}

#[test]
fn test_write_2000_bytes_on_small_device() {
    let (dev, fs) = setup_test_fs(64, Config::default());
    let data = vec![b'A'; 2000];

    let mut file = fs
        .open("/f", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    assert_eq!(file.write(&data).unwrap(), 2000);
    file.sync().unwrap();
    file.close().unwrap();

    let fs = remount(&dev, fs);
    let info = fs.stat("/f").unwrap();
    assert!(info.is_file());
    assert_eq!(info.size, 2000);
    assert_eq!(fs.read_to_vec("/f").unwrap(), data);
}

#[test]
fn test_inline_threshold_round_trip() {
    let (dev, fs) = setup_test_fs(64, Config::default());
    let inline_max = fs.geometry().inline_max as usize;
    assert_eq!(inline_max, 64);

    let sizes = [inline_max - 1, inline_max, inline_max + 1];
    for (i, &size) in sizes.iter().enumerate() {
        let data: Vec<u8> = (0..size).map(|b| (b * 7 + i) as u8).collect();
        fs.write_file(&format!("/f{}", i), &data).unwrap();
    }

    let fs = remount(&dev, fs);
    for (i, &size) in sizes.iter().enumerate() {
        let data: Vec<u8> = (0..size).map(|b| (b * 7 + i) as u8).collect();
        assert_eq!(fs.read_to_vec(&format!("/f{}", i)).unwrap(), data, "size {}", size);
    }
}

#[test]
fn test_unsynced_writes_are_dropped() {
    let (dev, fs) = setup_test_fs(64, Config::default());
    fs.write_file("/f", b"committed").unwrap();

    let mut file = fs.open("/f", OpenFlags::WRONLY | OpenFlags::TRUNC).unwrap();
    file.write(&[b'x'; 1000]).unwrap();
    file.close().unwrap();

    let fs = remount(&dev, fs);
    assert_eq!(fs.read_to_vec("/f").unwrap(), b"committed");
}

#[test]
fn test_seek_overwrite_and_append() {
    let (_dev, fs) = setup_test_fs(64, Config::default());

    let mut file = fs
        .open("/greeting", OpenFlags::RDWR | OpenFlags::CREAT)
        .unwrap();
    file.write(b"hello world").unwrap();
    assert_eq!(file.seek(SeekFrom::Start(6)).unwrap(), 6);
    file.write(b"WORLD").unwrap();
    file.rewind().unwrap();
    let mut buf = [0u8; 11];
    assert_eq!(file.read(&mut buf).unwrap(), 11);
    assert_eq!(&buf, b"hello WORLD");
    assert_eq!(file.tell().unwrap(), 11);
    file.sync().unwrap();
    drop(file);

    let mut file = fs
        .open("/greeting", OpenFlags::WRONLY | OpenFlags::APPEND)
        .unwrap();
    file.write(b"!").unwrap();
    file.sync().unwrap();
    drop(file);
    assert_eq!(fs.read_to_vec("/greeting").unwrap(), b"hello WORLD!");
}

#[test]
fn test_seek_past_end_leaves_zeros() {
    let (_dev, fs) = setup_test_fs(64, Config::default());

    let mut file = fs
        .open("/sparse", OpenFlags::RDWR | OpenFlags::CREAT)
        .unwrap();
    file.seek(SeekFrom::Start(100)).unwrap();
    file.write(b"x").unwrap();
    assert_eq!(file.size().unwrap(), 101);
    file.sync().unwrap();
    drop(file);

    let data = fs.read_to_vec("/sparse").unwrap();
    assert_eq!(data.len(), 101);
    assert!(data[..100].iter().all(|&b| b == 0));
    assert_eq!(data[100], b'x');

    let mut file = fs.open("/sparse", OpenFlags::RDONLY).unwrap();
    assert!(matches!(
        file.seek(SeekFrom::Current(-200)),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn test_truncate_shrink_grow_and_inline() {
    let (dev, fs) = setup_test_fs(64, Config::default());
    let mut rng = StdRng::seed_from_u64(7);
    let mut data = vec![0u8; 3000];
    rng.fill(&mut data[..]);

    let mut file = fs.open("/t", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    file.write(&data).unwrap();
    file.sync().unwrap();

    file.truncate(1000).unwrap();
    assert_eq!(file.size().unwrap(), 1000);
    file.rewind().unwrap();
    let mut buf = vec![0u8; 3000];
    assert_eq!(file.read(&mut buf).unwrap(), 1000);
    assert_eq!(&buf[..1000], &data[..1000]);

    file.truncate(2500).unwrap();
    file.rewind().unwrap();
    assert_eq!(file.read(&mut buf).unwrap(), 2500);
    assert_eq!(&buf[..1000], &data[..1000]);
    assert!(buf[1000..2500].iter().all(|&b| b == 0));

    file.truncate(30).unwrap();
    assert_eq!(file.size().unwrap(), 30);
    file.sync().unwrap();
    drop(file);

    let fs = remount(&dev, fs);
    assert_eq!(fs.stat("/t").unwrap().size, 30);
    assert_eq!(fs.read_to_vec("/t").unwrap(), &data[..30]);
}

#[test]
fn test_file_too_large() {
    let config = Config {
        file_max: 1000,
        ..Config::default()
    };
    let (_dev, fs) = setup_test_fs(64, config);

    let mut file = fs.open("/big", OpenFlags::WRONLY | OpenFlags::CREAT).unwrap();
    let err = file.write(&[0u8; 1001]).unwrap_err();
    assert!(matches!(err, Error::FileTooLarge));
    assert_eq!(err.errno(), -libc::EFBIG);
    assert_eq!(file.write(&[0u8; 1000]).unwrap(), 1000);
}

#[test]
fn test_allocator_never_reuses_live_blocks() {
    let (dev, fs) = setup_test_fs(256, Config::default());
    let mut rng = StdRng::seed_from_u64(42);
    let mut contents: Vec<Vec<u8>> = vec![Vec::new(); 10];

    for round in 0..6 {
        for (i, content) in contents.iter_mut().enumerate() {
            let len = rng.gen_range(0..2500);
            let mut data = vec![0u8; len];
            rng.fill(&mut data[..]);
            fs.write_file(&format!("/file{}", i), &data).unwrap();
            *content = data;
        }

        for (i, content) in contents.iter().enumerate() {
            assert_eq!(
                &fs.read_to_vec(&format!("/file{}", i)).unwrap(),
                content,
                "round {} file {}",
                round,
                i
            );
        }

        // every live block belongs to exactly one structure
        let mut seen = HashSet::new();
        fs.traverse(|block| {
            assert!(block < 256);
            assert!(seen.insert(block), "block {} is shared", block);
        })
        .unwrap();
        assert_eq!(seen.len() as u32, fs.fs_size().unwrap());
    }

    let fs = remount(&dev, fs);
    for (i, content) in contents.iter().enumerate() {
        assert_eq!(&fs.read_to_vec(&format!("/file{}", i)).unwrap(), content);
    }
}

#[test]
fn test_statvfs_accounting() {
    let (_dev, fs) = setup_test_fs(64, Config::default());

    let stat = fs.statvfs().unwrap();
    assert_eq!(stat.block_size, 512);
    assert_eq!(stat.block_count, 64);
    assert_eq!(stat.blocks_used, 2);
    assert_eq!(stat.blocks_free, 62);
    assert_eq!(stat.name_max, 255);

    // 2000 bytes take four list blocks: 512 + 508 + 504 + 476
    fs.write_file("/f", &[1u8; 2000]).unwrap();
    let stat = fs.statvfs().unwrap();
    assert_eq!(stat.blocks_used, 6);
    assert_eq!(stat.blocks_free, 58);

    // inline files live in the metadata pair
    fs.write_file("/f", &[1u8; 10]).unwrap();
    assert_eq!(fs.statvfs().unwrap().blocks_used, 2);
}

#[test]
fn test_std_io_traits() {
    let (_dev, fs) = setup_test_fs(64, Config::default());

    let mut file = fs.open("/io", OpenFlags::RDWR | OpenFlags::CREAT).unwrap();
    write!(file, "{}-{}", "pebble", 42).unwrap();
    Write::flush(&mut file).unwrap();
    Seek::seek(&mut file, SeekFrom::Start(0)).unwrap();
    let mut text = String::new();
    Read::read_to_string(&mut file, &mut text).unwrap();
    assert_eq!(text, "pebble-42");
}

#[test]
fn test_image_file_backend() {
    env_logger::builder().is_test(true).try_init().ok();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pebble.img");
    let config = Config::default();

    let mut dev = FileBackedBlockDevice::create(&path, 64 * 512, 512).unwrap();
    Filesystem::format(&mut dev, &config).unwrap();
    let fs = Filesystem::mount(dev, config.clone()).unwrap();
    fs.mkdir("/etc").unwrap();
    fs.write_file("/etc/motd", &[b'm'; 700]).unwrap();
    fs.unmount().unwrap();

    let dev = FileBackedBlockDevice::open(&path, true, 512).unwrap();
    let fs = Filesystem::mount(dev, config).unwrap();
    assert_eq!(fs.read_to_vec("/etc/motd").unwrap(), vec![b'm'; 700]);
}

#[test]
fn test_failed_mount_keeps_borrowed_device() {
    env_logger::builder().is_test(true).try_init().ok();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blank.img");
    let config = Config::default();

    let mut dev = FileBackedBlockDevice::create(&path, 64 * 512, 512).unwrap();
    let err = Filesystem::mount(&mut dev, config.clone()).err().unwrap();
    assert!(matches!(err, Error::Corrupt));

    // the same handle can still be formatted and mounted
    Filesystem::format(&mut dev, &config).unwrap();
    let fs = Filesystem::mount(&mut dev, config).unwrap();
    fs.write_file("/first", b"boot").unwrap();
    assert_eq!(fs.read_to_vec("/first").unwrap(), b"boot");
    fs.unmount().unwrap();
}
