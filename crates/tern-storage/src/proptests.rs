use crate::{
    ChunkedDisk, CodecId, Decompressor, MemBackend, RawDisk, Result, VhdDisk, VirtualDisk,
    VmdkDisk, SECTOR_SIZE,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

const SECTOR: usize = SECTOR_SIZE;
const SECTOR_U64: u64 = SECTOR_SIZE as u64;

const MAX_READS: usize = 24;

fn write_be_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
}

fn write_be_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_be_bytes());
}

fn write_le_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

fn write_le_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
}

fn ones_complement_sum(raw: &[u8], skip: std::ops::Range<usize>) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in raw.iter().enumerate() {
        if skip.contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

/// Every read is checked against the byte-for-byte model, twice: the second
/// pass must observe identical bytes no matter what the caches did in the
/// first.
fn check_reads<D: VirtualDisk>(
    disk: &mut D,
    model: &[u8],
    reads: &[(u32, u16)],
) -> TestCaseResult {
    prop_assert_eq!(disk.capacity_bytes() as usize, model.len());

    for &(offset_seed, len_seed) in reads {
        let offset = offset_seed as usize % model.len();
        let len = (len_seed as usize).min(model.len() - offset);

        let mut first = vec![0xA5u8; len];
        disk.read_at(offset as u64, &mut first).unwrap();
        prop_assert_eq!(first.as_slice(), &model[offset..offset + len]);

        let mut second = vec![0x5Au8; len];
        disk.read_at(offset as u64, &mut second).unwrap();
        prop_assert_eq!(second.as_slice(), first.as_slice());
    }

    let mut all = vec![0u8; model.len()];
    disk.read_at(0, &mut all).unwrap();
    prop_assert_eq!(all.as_slice(), model);

    Ok(())
}

fn reads_strategy() -> BoxedStrategy<Vec<(u32, u16)>> {
    prop::collection::vec((any::<u32>(), any::<u16>()), 1..=MAX_READS).boxed()
}

// ---------------------------------------------------------------------------
// Chunked images
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
enum RunPlan {
    Zero(u8),
    Unallocated(u8),
    Copy(u8, u8),
    Compressed(u8, u8),
}

impl RunPlan {
    fn sectors(&self) -> u64 {
        let raw = match self {
            RunPlan::Zero(n)
            | RunPlan::Unallocated(n)
            | RunPlan::Copy(n, _)
            | RunPlan::Compressed(n, _) => *n,
        };
        (raw % 8) as u64 + 1
    }
}

fn run_plan_strategy() -> BoxedStrategy<RunPlan> {
    prop_oneof![
        any::<u8>().prop_map(RunPlan::Zero),
        any::<u8>().prop_map(RunPlan::Unallocated),
        (any::<u8>(), any::<u8>()).prop_map(|(n, f)| RunPlan::Copy(n, f)),
        (any::<u8>(), any::<u8>()).prop_map(|(n, f)| RunPlan::Compressed(n, f)),
    ]
    .boxed()
}

struct IdentityCodec;

impl Decompressor for IdentityCodec {
    fn decode(&mut self, _codec: CodecId, input: &[u8], max_len: usize) -> Result<Vec<u8>> {
        Ok(input[..input.len().min(max_len)].to_vec())
    }
}

/// Build a table + data extent + model from a run plan. Payloads are laid out
/// back to back; "compressed" payloads use the identity codec.
fn make_chunked(runs: &[RunPlan]) -> (MemBackend, Vec<u8>, Vec<u8>) {
    let mut data = MemBackend::new();
    let mut model = Vec::new();
    let mut entries: Vec<[u8; 40]> = Vec::new();
    let mut cursor = 0u64;
    let mut data_cursor = 0u64;

    for run in runs {
        let sectors = run.sectors();
        let decoded_len = (sectors * SECTOR_U64) as usize;

        let (entry_type, payload): (u32, Option<Vec<u8>>) = match run {
            RunPlan::Zero(_) => (0x0000_0000, None),
            RunPlan::Unallocated(_) => (0x0000_0002, None),
            RunPlan::Copy(_, fill) => {
                let bytes: Vec<u8> = (0..decoded_len)
                    .map(|i| fill.wrapping_add(i as u8))
                    .collect();
                (0x0000_0001, Some(bytes))
            }
            RunPlan::Compressed(_, fill) => {
                let bytes: Vec<u8> = (0..decoded_len)
                    .map(|i| fill.wrapping_mul(3).wrapping_add(i as u8))
                    .collect();
                (0x8000_0005, Some(bytes))
            }
        };

        let mut entry = [0u8; 40];
        write_be_u32(&mut entry, 0, entry_type);
        write_be_u64(&mut entry, 8, cursor);
        write_be_u64(&mut entry, 16, sectors);
        match payload {
            Some(bytes) => {
                write_be_u64(&mut entry, 24, data_cursor);
                write_be_u64(&mut entry, 32, bytes.len() as u64);
                model.extend_from_slice(&bytes);
                data.write_at(data_cursor, &bytes).unwrap();
                data_cursor += bytes.len() as u64;
            }
            None => {
                model.extend_from_slice(&vec![0u8; decoded_len]);
            }
        }
        entries.push(entry);
        cursor += sectors;
    }

    let mut terminator = [0u8; 40];
    write_be_u32(&mut terminator, 0, 0xFFFF_FFFF);
    write_be_u64(&mut terminator, 8, cursor);
    entries.push(terminator);

    let mut table = vec![0u8; 204 + entries.len() * 40];
    write_be_u32(&mut table, 0, 0x6D69_7368);
    write_be_u32(&mut table, 4, 1);
    write_be_u64(&mut table, 16, cursor);
    write_be_u64(&mut table, 24, 0); // data base
    write_be_u32(&mut table, 200, entries.len() as u32);
    for (i, entry) in entries.iter().enumerate() {
        table[204 + i * 40..204 + (i + 1) * 40].copy_from_slice(entry);
    }

    (data, table, model)
}

fn cache_budget_strategy() -> BoxedStrategy<u64> {
    // Small budgets force the wholesale-clear path; the default never does in
    // fixtures this size.
    prop_oneof![Just(512u64), Just(4096u64), Just(16 * 1024 * 1024u64)].boxed()
}

// ---------------------------------------------------------------------------
// VHD-style sparse images
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct BlockPlan {
    bitmap_byte: u8,
    fill: u8,
}

const VHD_BLOCK_SIZE: u32 = 4096; // 8 sectors, 1 bitmap byte, 512-byte bitmap

fn make_vhd_footer(virtual_size: u64, disk_type: u32, data_offset: u64) -> [u8; SECTOR] {
    let mut footer = [0u8; SECTOR];
    footer[0..8].copy_from_slice(b"conectix");
    write_be_u32(&mut footer, 12, 0x0001_0000);
    write_be_u64(&mut footer, 16, data_offset);
    write_be_u64(&mut footer, 40, virtual_size);
    write_be_u64(&mut footer, 48, virtual_size);
    write_be_u32(&mut footer, 60, disk_type);
    let checksum = ones_complement_sum(&footer, 64..68);
    write_be_u32(&mut footer, 64, checksum);
    footer
}

fn make_vhd_sparse(blocks: &[Option<BlockPlan>], disk_type: u32) -> MemBackend {
    let block_size = VHD_BLOCK_SIZE;
    let sectors_per_block = block_size as u64 / SECTOR_U64;
    let virtual_size = blocks.len() as u64 * block_size as u64;

    let sparse_header_offset = SECTOR_U64;
    let table_offset = sparse_header_offset + 1024;
    let bat_bytes = blocks.len() as u64 * 4;
    let bat_size = bat_bytes.div_ceil(SECTOR_U64) * SECTOR_U64;
    let bitmap_size = SECTOR_U64;
    let data_start = table_offset + bat_size;

    let mut backend = MemBackend::new();

    let mut sparse_header = [0u8; 1024];
    sparse_header[0..8].copy_from_slice(b"cxsparse");
    write_be_u64(&mut sparse_header, 8, u64::MAX);
    write_be_u64(&mut sparse_header, 16, table_offset);
    write_be_u32(&mut sparse_header, 24, 0x0001_0000);
    write_be_u32(&mut sparse_header, 28, blocks.len() as u32);
    write_be_u32(&mut sparse_header, 32, block_size);
    let checksum = ones_complement_sum(&sparse_header, 36..40);
    write_be_u32(&mut sparse_header, 36, checksum);
    backend.write_at(sparse_header_offset, &sparse_header).unwrap();

    let mut next_block = data_start;
    for (i, plan) in blocks.iter().enumerate() {
        let bat_entry: u32 = match plan {
            None => u32::MAX,
            Some(plan) => {
                let block_start = next_block;
                next_block += bitmap_size + block_size as u64;

                let mut bitmap = vec![0u8; bitmap_size as usize];
                bitmap[0] = plan.bitmap_byte;
                backend.write_at(block_start, &bitmap).unwrap();

                for s in 0..sectors_per_block {
                    let mut sector = [0u8; SECTOR];
                    sector.fill(plan.fill.wrapping_add(s as u8));
                    backend
                        .write_at(block_start + bitmap_size + s * SECTOR_U64, &sector)
                        .unwrap();
                }

                (block_start / SECTOR_U64) as u32
            }
        };
        backend
            .write_at(table_offset + i as u64 * 4, &bat_entry.to_be_bytes())
            .unwrap();
    }

    let footer = make_vhd_footer(virtual_size, disk_type, sparse_header_offset);
    backend.write_at(0, &footer).unwrap();
    backend.write_at(next_block, &footer).unwrap();

    backend
}

/// Model bytes for one sparse image: present sectors carry their fill
/// pattern, absent sectors fall back to `base` (zeros for a dynamic image).
fn vhd_model(blocks: &[Option<BlockPlan>], base: Option<&[u8]>) -> Vec<u8> {
    let sectors_per_block = VHD_BLOCK_SIZE as u64 / SECTOR_U64;
    let mut model = vec![0u8; blocks.len() * VHD_BLOCK_SIZE as usize];
    if let Some(base) = base {
        model.copy_from_slice(base);
    }

    for (i, plan) in blocks.iter().enumerate() {
        let Some(plan) = plan else { continue };
        for s in 0..sectors_per_block {
            let bit = 7 - (s % 8) as u8;
            if plan.bitmap_byte & (1 << bit) == 0 {
                continue;
            }
            let at = i * VHD_BLOCK_SIZE as usize + (s as usize) * SECTOR;
            model[at..at + SECTOR].fill(plan.fill.wrapping_add(s as u8));
        }
    }

    model
}

fn vhd_blocks_strategy() -> BoxedStrategy<Vec<Option<BlockPlan>>> {
    prop::collection::vec(
        prop::option::of(
            (any::<u8>(), any::<u8>()).prop_map(|(bitmap_byte, fill)| BlockPlan {
                bitmap_byte,
                fill,
            }),
        ),
        1..=8,
    )
    .boxed()
}

fn make_base_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

// ---------------------------------------------------------------------------
// Sparse VM (grain directory) images
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
enum GrainPlan {
    Hole,
    Zero,
    Data(u8),
}

const VMDK_GRAIN_SECTORS: u64 = 8; // 4 KiB grains
const VMDK_GTES_PER_GT: u32 = 4;

fn grain_plan_strategy() -> BoxedStrategy<Vec<GrainPlan>> {
    prop::collection::vec(
        prop_oneof![
            Just(GrainPlan::Hole),
            Just(GrainPlan::Zero),
            any::<u8>().prop_map(GrainPlan::Data),
        ],
        1..=16,
    )
    .boxed()
}

fn make_vmdk(grains: &[GrainPlan]) -> (MemBackend, Vec<u8>) {
    let grain_bytes = (VMDK_GRAIN_SECTORS * SECTOR_U64) as usize;
    let capacity_sectors = grains.len() as u64 * VMDK_GRAIN_SECTORS;

    let gd_entries = (grains.len() as u64).div_ceil(VMDK_GTES_PER_GT as u64);
    let gd_sectors = (gd_entries * 4).div_ceil(SECTOR_U64);
    let gt_sectors = (VMDK_GTES_PER_GT as u64 * 4).div_ceil(SECTOR_U64);

    let gd_offset = 1u64;
    let gt_base = gd_offset + gd_sectors;
    let overhead = gt_base + gd_entries * gt_sectors;

    let mut backend = MemBackend::new();
    let mut model = vec![0u8; capacity_sectors as usize * SECTOR];

    let mut header = [0u8; SECTOR];
    header[0..4].copy_from_slice(b"KDMV");
    write_le_u32(&mut header, 4, 1); // version
    write_le_u64(&mut header, 12, capacity_sectors);
    write_le_u64(&mut header, 20, VMDK_GRAIN_SECTORS);
    write_le_u32(&mut header, 44, VMDK_GTES_PER_GT);
    write_le_u64(&mut header, 56, gd_offset);
    write_le_u64(&mut header, 64, overhead);
    backend.write_at(0, &header).unwrap();
    // Metadata region exists in full even when most of it stays zero.
    backend.set_len(overhead * SECTOR_U64).unwrap();

    let mut next_data_sector = overhead;
    for (i, plan) in grains.iter().enumerate() {
        let gd_index = i / VMDK_GTES_PER_GT as usize;
        let gt_index = i % VMDK_GTES_PER_GT as usize;
        let gt_offset = gt_base + gd_index as u64 * gt_sectors;
        backend
            .write_at(
                gd_offset * SECTOR_U64 + gd_index as u64 * 4,
                &(gt_offset as u32).to_le_bytes(),
            )
            .unwrap();

        let pointer: u32 = match plan {
            GrainPlan::Hole => 0,
            GrainPlan::Zero => 1,
            GrainPlan::Data(fill) => {
                let at = next_data_sector;
                next_data_sector += VMDK_GRAIN_SECTORS;
                let bytes: Vec<u8> = (0..grain_bytes)
                    .map(|b| fill.wrapping_add(b as u8))
                    .collect();
                backend.write_at(at * SECTOR_U64, &bytes).unwrap();
                model[i * grain_bytes..(i + 1) * grain_bytes].copy_from_slice(&bytes);
                at as u32
            }
        };
        backend
            .write_at(gt_offset * SECTOR_U64 + gt_index as u64 * 4, &pointer.to_le_bytes())
            .unwrap();
    }

    (backend, model)
}

/// Apply parent fallback to a grain-level model: holes read from `base`.
fn vmdk_model_with_parent(grains: &[GrainPlan], model: &[u8], base: &[u8]) -> Vec<u8> {
    let grain_bytes = (VMDK_GRAIN_SECTORS * SECTOR_U64) as usize;
    let mut out = model.to_vec();
    for (i, plan) in grains.iter().enumerate() {
        if matches!(plan, GrainPlan::Hole) {
            let at = i * grain_bytes;
            out[at..at + grain_bytes].copy_from_slice(&base[at..at + grain_bytes]);
        }
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_chunked_disk_matches_model(
        (runs, cache_bytes, reads) in (
            prop::collection::vec(run_plan_strategy(), 1..=16),
            cache_budget_strategy(),
            reads_strategy(),
        )
    ) {
        let (data, table, model) = make_chunked(&runs);
        let mut disk = ChunkedDisk::open_with_cache(
            data,
            &table,
            Box::new(IdentityCodec),
            cache_bytes,
        )
        .unwrap();

        check_reads(&mut disk, &model, &reads)?;
    }

    #[test]
    fn prop_vhd_dynamic_matches_model(
        (blocks, reads) in (vhd_blocks_strategy(), reads_strategy())
    ) {
        let backend = make_vhd_sparse(&blocks, 3);
        let model = vhd_model(&blocks, None);

        let mut disk = VhdDisk::open(backend.clone()).unwrap();
        check_reads(&mut disk, &model, &reads)?;

        // Re-opening the same bytes decodes the same image.
        let mut reopened = VhdDisk::open(backend).unwrap();
        check_reads(&mut reopened, &model, &reads)?;
    }

    #[test]
    fn prop_vhd_differencing_matches_model(
        (blocks, seed, reads) in (vhd_blocks_strategy(), any::<u8>(), reads_strategy())
    ) {
        let virtual_size = blocks.len() * VHD_BLOCK_SIZE as usize;
        let base = make_base_pattern(virtual_size, seed);

        let mut parent_backend = MemBackend::new();
        parent_backend.write_at(0, &base).unwrap();
        let parent = RawDisk::open(parent_backend).unwrap();

        let backend = make_vhd_sparse(&blocks, 4);
        let model = vhd_model(&blocks, Some(&base));

        let mut disk = VhdDisk::open_with_parent(backend, Box::new(parent)).unwrap();
        prop_assert_eq!(disk.parent_chain_len(), 1);
        check_reads(&mut disk, &model, &reads)?;
    }

    #[test]
    fn prop_vmdk_matches_model(
        (grains, seed, with_parent, cache_bytes, reads) in (
            grain_plan_strategy(),
            any::<u8>(),
            any::<bool>(),
            cache_budget_strategy(),
            reads_strategy(),
        )
    ) {
        let (backend, local_model) = make_vmdk(&grains);

        if with_parent {
            let base = make_base_pattern(local_model.len(), seed);
            let mut parent_backend = MemBackend::new();
            parent_backend.write_at(0, &base).unwrap();
            let parent = RawDisk::open(parent_backend).unwrap();

            let model = vmdk_model_with_parent(&grains, &local_model, &base);
            let mut disk =
                VmdkDisk::open_with_cache(backend, Some(Box::new(parent)), cache_bytes).unwrap();
            check_reads(&mut disk, &model, &reads)?;
        } else {
            let mut disk = VmdkDisk::open_with_cache(backend, None, cache_bytes).unwrap();
            check_reads(&mut disk, &local_model, &reads)?;
        }
    }
}
