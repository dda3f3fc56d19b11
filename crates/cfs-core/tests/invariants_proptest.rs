#![forbid(unsafe_code)]

use cfs_core::{
    BlockCache, CacheConfig, CfsError, ContigFs, FileHandle, FsConfig, MemoryFlash, OpenMode,
    SeekFrom,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

const BS: u32 = 512;
const BLOCKS: u16 = 24;
const FILES: usize = 5;

#[derive(Debug, Clone)]
enum Op {
    Append { file: usize, len: usize },
    Reserve { file: usize, blocks: u64 },
    Close { file: usize },
    Unlink { file: usize },
    Defragment,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..FILES, 1..1500_usize).prop_map(|(file, len)| Op::Append { file, len }),
        2 => (0..FILES, 1..8_u64).prop_map(|(file, blocks)| Op::Reserve { file, blocks }),
        2 => (0..FILES).prop_map(|file| Op::Close { file }),
        1 => (0..FILES).prop_map(|file| Op::Unlink { file }),
        1 => Just(Op::Defragment),
    ]
}

fn config() -> FsConfig {
    FsConfig {
        block_size: BS,
        max_files: 6,
        max_open_files: 6,
        ..FsConfig::default()
    }
}

fn mount(flash: &Arc<MemoryFlash>) -> ContigFs {
    let cache = Arc::new(
        BlockCache::new(CacheConfig {
            buffers: 4,
            buffer_size: BS as usize,
            ..CacheConfig::default()
        })
        .expect("cache"),
    );
    let device = cache.register(flash.clone()).expect("register");
    ContigFs::mount(cache, device, &config()).expect("mount")
}

fn name(file: usize) -> String {
    format!("file-{file}")
}

/// Filesystem under test plus the expected contents of every file.
struct Harness {
    fs: ContigFs,
    files: BTreeMap<usize, Vec<u8>>,
    handles: BTreeMap<usize, FileHandle>,
    step: u8,
}

impl Harness {
    fn handle(&mut self, file: usize) -> FileHandle {
        if let Some(&h) = self.handles.get(&file) {
            return h;
        }
        let h = self
            .fs
            .open(&name(file), OpenMode::ReadWrite, true)
            .expect("open");
        self.files.entry(file).or_default();
        self.handles.insert(file, h);
        h
    }

    fn apply(&mut self, op: &Op) {
        self.step = self.step.wrapping_add(1);
        match *op {
            Op::Append { file, len } => {
                let h = self.handle(file);
                self.fs.seek(h, SeekFrom::End(0)).expect("seek end");
                let step = self.step;
                let data: Vec<u8> = (0..len).map(|i| step.wrapping_add((i % 13) as u8)).collect();
                match self.fs.write(h, &data) {
                    Ok(n) => {
                        assert!(n > 0 && n <= len);
                        self.files
                            .get_mut(&file)
                            .expect("modelled")
                            .extend_from_slice(&data[..n]);
                    }
                    Err(CfsError::OutOfSpace) => {}
                    Err(err) => panic!("append failed: {err}"),
                }
            }
            Op::Reserve { file, blocks } => {
                let h = self.handle(file);
                match self.fs.reserve(h, blocks * u64::from(BS)) {
                    Ok(()) | Err(CfsError::OutOfSpace) => {}
                    Err(err) => panic!("reserve failed: {err}"),
                }
            }
            Op::Close { file } => {
                if let Some(h) = self.handles.remove(&file) {
                    self.fs.close(h).expect("close");
                }
            }
            Op::Unlink { file } => {
                if self.files.remove(&file).is_some() {
                    self.fs.unlink(&name(file)).expect("unlink");
                }
                if let Some(h) = self.handles.remove(&file) {
                    self.fs.close(h).expect("close detached");
                }
            }
            Op::Defragment => {
                self.fs.defragment().expect("defragment");
            }
        }
    }

    fn check(&self) {
        self.fs.check_consistency().expect("consistent");
        let listed = self.fs.list();
        let held: u32 = listed
            .iter()
            .map(|info| u32::from(info.block_count) + u32::from(info.reserved_blocks))
            .sum();
        assert_eq!(
            u32::from(self.fs.usage().free_blocks) + held,
            u32::from(BLOCKS) - 1
        );
        assert_eq!(listed.len(), self.files.len());
        for (&file, data) in &self.files {
            let stat = self.fs.stat(&name(file)).expect("stat");
            assert_eq!(stat.size, data.len() as u64);
            assert!(stat.size <= u64::from(stat.blocks) * u64::from(BS));
        }
    }

    fn verify_contents(&self, fs: &ContigFs) {
        for (&file, data) in &self.files {
            let h = fs.open(&name(file), OpenMode::ReadOnly, false).expect("open");
            let mut out = vec![0_u8; data.len()];
            assert_eq!(fs.read(h, &mut out).expect("read"), data.len());
            assert_eq!(&out, data, "{} differs", name(file));
            fs.close(h).expect("close");
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn random_workload_keeps_table_consistent(
        ops in proptest::collection::vec(op_strategy(), 1..60)
    ) {
        let flash = Arc::new(
            MemoryFlash::new(usize::from(BLOCKS) * BS as usize, BS).expect("flash"),
        );
        let mut harness = Harness {
            fs: mount(&flash),
            files: BTreeMap::new(),
            handles: BTreeMap::new(),
            step: 0,
        };
        for op in &ops {
            harness.apply(op);
            harness.check();
        }
        harness.verify_contents(&harness.fs);

        harness.fs.shutdown().expect("shutdown");
        let remounted = mount(&flash);
        remounted.check_consistency().expect("consistent after remount");
        prop_assert_eq!(remounted.list().len(), harness.files.len());
        harness.verify_contents(&remounted);
    }
}
