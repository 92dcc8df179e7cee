//! In-process integration tests for the code cache.
//!
//! These drive the cache through a scripted emitter that writes real
//! AArch64 words into the arena (so the linker's patches can be checked
//! word-for-word) but never executes them, keeping the tests host-agnostic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tarmac::ir::{Block, Cond, LocationDescriptor, Terminal};
use tarmac::jit::aarch64::encode;
use tarmac::jit::codebuf::CodeWriter;
use tarmac::jit::regs;
use tarmac::{
    AddressSpace, BlockEmitter, BlockRelocation, BlockRelocationKind, CodePtr,
    DoNotFastmemMarker, EmitConfig, EmittedBlockInfo, FakeCall, FastmemManager, FastmemPatchInfo,
    HostCallback, LinkTarget, Relocation, RuntimeCallbacks,
};

extern "C" fn stub_helper(_user: u64, _a: u32, _b: u32) -> u64 {
    0
}

extern "C" fn stub_lookup(_user: usize) -> usize {
    0
}

/// One step of a scripted block body.
#[derive(Clone)]
enum Directive {
    /// Plain filler words.
    Nop(usize),
    /// A prelude relocation slot (one word).
    PreludeReloc(LinkTarget),
    /// An inter-block branch slot (one word) targeting the raw descriptor.
    BranchSlot(u64),
    /// A MoveToScratch1 slot (two words) targeting the raw descriptor.
    ScratchSlot(u64),
    /// A fastmem access site; emitted inline (one word, with patch info)
    /// unless the manager has banned it, then out-of-line (two words, no
    /// patch info).
    FastmemSite { recompile: bool },
}

#[derive(Clone)]
struct BlockScript {
    terminal: Terminal,
    directives: Vec<Directive>,
}

impl Default for BlockScript {
    fn default() -> Self {
        BlockScript {
            terminal: Terminal::ReturnToDispatch,
            directives: vec![Directive::PreludeReloc(LinkTarget::ReturnToDispatcher)],
        }
    }
}

type Program = Arc<Mutex<HashMap<u64, BlockScript>>>;

struct ScriptedEmitter {
    program: Program,
}

impl BlockEmitter for ScriptedEmitter {
    fn emit(
        &mut self,
        code: &mut CodeWriter,
        block: Block,
        _config: &EmitConfig,
        fastmem: &FastmemManager,
    ) -> EmittedBlockInfo {
        let script = self
            .program
            .lock()
            .unwrap()
            .get(&block.location().value())
            .cloned()
            .unwrap_or_default();

        let entry_point = code.ptr();
        let mut info = EmittedBlockInfo::new(entry_point);

        for directive in &script.directives {
            let offset = code.ptr().offset_from(entry_point);
            match directive {
                Directive::Nop(count) => {
                    for _ in 0..*count {
                        code.emit_u32(encode::nop());
                    }
                }
                Directive::PreludeReloc(target) => {
                    info.relocations.push(Relocation {
                        offset,
                        target: *target,
                    });
                    code.emit_u32(encode::nop());
                }
                Directive::BranchSlot(raw) => {
                    info.block_relocations
                        .entry(LocationDescriptor::new(*raw))
                        .or_default()
                        .push(BlockRelocation {
                            offset,
                            kind: BlockRelocationKind::Branch,
                        });
                    code.emit_u32(encode::nop());
                }
                Directive::ScratchSlot(raw) => {
                    info.block_relocations
                        .entry(LocationDescriptor::new(*raw))
                        .or_default()
                        .push(BlockRelocation {
                            offset,
                            kind: BlockRelocationKind::MoveToScratch1,
                        });
                    code.emit_u32(encode::nop());
                    code.emit_u32(encode::nop());
                }
                Directive::FastmemSite { recompile } => {
                    let marker = DoNotFastmemMarker {
                        location: block.location(),
                        offset,
                    };
                    if fastmem.should_fastmem(marker) {
                        info.fastmem_patch_info.insert(
                            offset,
                            FastmemPatchInfo {
                                fake_call: FakeCall {
                                    call_pc: entry_point.add(offset),
                                    ret_pc: Some(entry_point.add(offset + 4)),
                                },
                                recompile: *recompile,
                                marker,
                            },
                        );
                        code.emit_u32(encode::nop());
                    } else {
                        // Out-of-line sequence: wider, no recovery site.
                        code.emit_u32(encode::nop());
                        code.emit_u32(encode::nop());
                    }
                }
            }
        }

        info.size = code.ptr().offset_from(entry_point);
        info
    }
}

struct Harness {
    program: Program,
    space: AddressSpace,
}

impl Harness {
    fn new(cache_size: usize, config: EmitConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let program: Program = Arc::new(Mutex::new(HashMap::new()));

        let producer_program = program.clone();
        let producer = Box::new(move |location: LocationDescriptor| {
            let terminal = producer_program
                .lock()
                .unwrap()
                .get(&location.value())
                .map(|s| s.terminal.clone())
                .unwrap_or(Terminal::ReturnToDispatch);
            Block::new(location, vec![], terminal)
        });

        let emitter = Box::new(ScriptedEmitter {
            program: program.clone(),
        });

        let callbacks = RuntimeCallbacks::new(
            HostCallback::new(stub_helper as usize, 0),
            HostCallback::new(stub_lookup as usize, 0),
        );

        let space = AddressSpace::new(config, cache_size, &callbacks, producer, emitter)
            .expect("arena allocation failed");

        Harness { program, space }
    }

    fn script(&self, raw: u64, script: BlockScript) {
        self.program.lock().unwrap().insert(raw, script);
    }

    fn word_at(&self, ptr: CodePtr) -> u32 {
        unsafe { ptr.as_ptr::<u32>().read() }
    }
}

fn loc(raw: u64) -> LocationDescriptor {
    LocationDescriptor::new(raw)
}

#[test]
fn test_get_or_emit_is_idempotent() {
    let mut h = Harness::new(8 * 1024 * 1024, EmitConfig::default());

    let first = h.space.get_or_emit(loc(0x1000));
    let second = h.space.get_or_emit(loc(0x1000));
    assert_eq!(first, second);
    assert_eq!(h.space.get(loc(0x1000)), Some(first));

    // The first block lands right after the prelude.
    assert_eq!(first, h.space.prelude_info().end_of_prelude);
}

#[test]
fn test_forward_and_reverse_maps_stay_bijective() {
    let mut h = Harness::new(8 * 1024 * 1024, EmitConfig::default());

    for raw in [0x1000u64, 0x2000, 0x3000, 0x4000] {
        h.space.get_or_emit(loc(raw));
    }

    for (location, entry) in h.space.block_entries().collect::<Vec<_>>() {
        assert_eq!(h.space.reverse_get_entry_point(entry), Some(entry));
        assert_eq!(h.space.reverse_get_location(entry), Some(location));
        let info = h.space.block_info(entry).expect("info present");
        assert_eq!(info.entry_point, entry);

        // Reverse lookup inside the block resolves to its entry.
        assert_eq!(
            h.space.reverse_get_entry_point(entry.add(info.size - 4)),
            Some(entry)
        );
    }
}

#[test]
fn test_live_blocks_never_overlap() {
    let mut h = Harness::new(8 * 1024 * 1024, EmitConfig::default());

    for raw in 0..16u64 {
        h.space.get_or_emit(loc(0x1000 + raw * 4));
    }

    let mut ranges: Vec<(usize, usize)> = h
        .space
        .block_entries()
        .map(|(_, entry)| {
            let info = h.space.block_info(entry).unwrap();
            (entry.addr(), entry.addr() + info.size)
        })
        .collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "blocks overlap: {pair:x?}");
    }
}

#[test]
fn test_reverse_lookup_below_all_blocks_is_none() {
    let h = Harness::new(8 * 1024 * 1024, EmitConfig::default());
    assert_eq!(h.space.reverse_get_entry_point(CodePtr::new(1)), None);
}

#[test]
fn test_greedy_multi_block_compilation() {
    let config = EmitConfig {
        multi_block_compilation: true,
        ..EmitConfig::default()
    };
    let mut h = Harness::new(8 * 1024 * 1024, config);

    h.script(
        0x1000,
        BlockScript {
            terminal: Terminal::If {
                cond: Cond::Eq,
                then_: Box::new(Terminal::LinkBlock(loc(0x2000))),
                else_: Box::new(Terminal::LinkBlock(loc(0x3000))),
            },
            directives: vec![
                Directive::BranchSlot(0x2000),
                Directive::BranchSlot(0x3000),
                Directive::PreludeReloc(LinkTarget::ReturnToDispatcher),
            ],
        },
    );

    let entry = h.space.get_or_emit(loc(0x1000));

    // All three blocks are resident after one request.
    let then_entry = h.space.get(loc(0x2000)).expect("then-successor compiled");
    let else_entry = h.space.get(loc(0x3000)).expect("else-successor compiled");

    // And the two conditional slots branch straight to them, not through
    // the dispatcher.
    assert_eq!(
        h.word_at(entry),
        encode::b(then_entry.addr() as i64 - entry.addr() as i64)
    );
    assert_eq!(
        h.word_at(entry.add(4)),
        encode::b(else_entry.addr() as i64 - entry.add(4).addr() as i64)
    );
}

#[test]
fn test_block_references_cover_block_relocations() {
    let config = EmitConfig {
        multi_block_compilation: true,
        ..EmitConfig::default()
    };
    let mut h = Harness::new(8 * 1024 * 1024, config);

    h.script(
        0x1000,
        BlockScript {
            terminal: Terminal::LinkBlock(loc(0x2000)),
            directives: vec![
                Directive::BranchSlot(0x2000),
                Directive::PreludeReloc(LinkTarget::ReturnToDispatcher),
            ],
        },
    );

    let entry = h.space.get_or_emit(loc(0x1000));
    let info = h.space.block_info(entry).unwrap().clone();
    for target in info.block_relocations.keys() {
        let refs = h.space.references_to(*target).expect("edge recorded");
        assert!(refs.contains(&entry));
    }
}

#[test]
fn test_self_modification_relinks_through_dispatcher() {
    let mut h = Harness::new(8 * 1024 * 1024, EmitConfig::default());

    // Block A branches to L; L is emitted afterwards.
    let dispatcher = h
        .space
        .prelude_info()
        .helper(LinkTarget::ReturnToDispatcher);

    h.script(
        0xA000,
        BlockScript {
            terminal: Terminal::LinkBlock(loc(0xB000)),
            directives: vec![
                Directive::BranchSlot(0xB000),
                Directive::ScratchSlot(0xB000),
                Directive::PreludeReloc(LinkTarget::ReturnToDispatcher),
            ],
        },
    );

    let a_entry = h.space.get_or_emit(loc(0xA000));

    // L absent: branch slot is a NOP, scratch slot materialises the
    // dispatcher.
    assert_eq!(h.word_at(a_entry), encode::nop());
    let scratch_slot = a_entry.add(4);
    assert_eq!(
        h.word_at(scratch_slot.add(4)),
        encode::add_imm(
            regs::SCRATCH1,
            regs::SCRATCH1,
            (dispatcher.addr() & 0xFFF) as u32
        )
    );

    // Emit L: both slots now reach it directly.
    let l_entry = h.space.get_or_emit(loc(0xB000));
    assert_eq!(
        h.word_at(a_entry),
        encode::b(l_entry.addr() as i64 - a_entry.addr() as i64)
    );
    assert_eq!(
        h.word_at(scratch_slot.add(4)),
        encode::add_imm(
            regs::SCRATCH1,
            regs::SCRATCH1,
            (l_entry.addr() & 0xFFF) as u32
        )
    );

    // Invalidate L: the slots fall back to the dispatcher route.
    let mut dead = std::collections::HashSet::new();
    dead.insert(loc(0xB000));
    h.space.invalidate_basic_blocks(&dead);

    assert_eq!(h.space.get(loc(0xB000)), None);
    assert_eq!(h.word_at(a_entry), encode::nop());
    assert_eq!(
        h.word_at(scratch_slot.add(4)),
        encode::add_imm(
            regs::SCRATCH1,
            regs::SCRATCH1,
            (dispatcher.addr() & 0xFFF) as u32
        )
    );

    // Re-emit L: direct links come back, at the new entry.
    let l_entry2 = h.space.get_or_emit(loc(0xB000));
    assert_ne!(l_entry, l_entry2);
    assert_eq!(
        h.word_at(a_entry),
        encode::b(l_entry2.addr() as i64 - a_entry.addr() as i64)
    );
}

#[test]
fn test_invalidate_retains_reverse_and_info_maps() {
    let mut h = Harness::new(8 * 1024 * 1024, EmitConfig::default());

    let entry = h.space.get_or_emit(loc(0x1000));

    let mut dead = std::collections::HashSet::new();
    dead.insert(loc(0x1000));
    h.space.invalidate_basic_blocks(&dead);

    // Forward entry gone, but faults inside the dead bytes can still be
    // localised.
    assert_eq!(h.space.get(loc(0x1000)), None);
    assert_eq!(h.space.reverse_get_location(entry), Some(loc(0x1000)));
    assert!(h.space.block_info(entry).is_some());
}

#[test]
fn test_cache_overflow_clears_and_recovers() {
    let mut h = Harness::new(2 * 1024 * 1024, EmitConfig::default());

    // 256 KiB of filler per block.
    let big = BlockScript {
        terminal: Terminal::ReturnToDispatch,
        directives: vec![
            Directive::Nop(65535),
            Directive::PreludeReloc(LinkTarget::ReturnToDispatcher),
        ],
    };

    let mut emitted = Vec::new();
    let mut raw = 0x1000u64;
    while !h.space.is_nearly_full() {
        h.script(raw, big.clone());
        h.space.get_or_emit(loc(raw));
        emitted.push(raw);
        raw += 0x10;
        assert!(emitted.len() < 64, "cache never filled up");
    }
    assert!(emitted.len() >= 2);

    // A fastmem ban recorded before the reset...
    let marker = DoNotFastmemMarker {
        location: loc(0xDEAD),
        offset: 0x8,
    };
    h.space.fastmem_manager().mark_do_not_fastmem(marker);

    // ...survives the wholesale clear triggered by the next request.
    h.script(0xF000, big.clone());
    let fresh = h.space.get_or_emit(loc(0xF000));

    assert_eq!(fresh, h.space.prelude_info().end_of_prelude);
    for old in emitted {
        assert_eq!(h.space.get(loc(old)), None);
    }
    assert!(!h.space.fastmem_manager().should_fastmem(marker));
}

#[test]
fn test_clear_cache_rewinds_cursor() {
    let mut h = Harness::new(8 * 1024 * 1024, EmitConfig::default());

    h.space.get_or_emit(loc(0x1000));
    h.space.get_or_emit(loc(0x2000));
    assert!(h.space.code_ptr() > h.space.prelude_info().end_of_prelude);

    h.space.clear_cache();
    assert_eq!(h.space.code_ptr(), h.space.prelude_info().end_of_prelude);
    assert_eq!(h.space.get(loc(0x1000)), None);
    assert_eq!(h.space.get(loc(0x2000)), None);
    assert_eq!(h.space.block_entries().count(), 0);
}

#[test]
fn test_fastmem_fault_localisation() {
    let mut h = Harness::new(8 * 1024 * 1024, EmitConfig::default());

    h.script(
        0x5000,
        BlockScript {
            terminal: Terminal::ReturnToDispatch,
            directives: vec![
                Directive::Nop(2),
                Directive::FastmemSite { recompile: false },
                Directive::PreludeReloc(LinkTarget::ReturnToDispatcher),
            ],
        },
    );

    let entry = h.space.get_or_emit(loc(0x5000));
    let site = entry.add(8);

    let expected = h.space.block_info(entry).unwrap().fastmem_patch_info[&8].fake_call;
    let fake_call = h.space.fastmem_callback(site.addr() as u64);
    assert_eq!(fake_call, expected);

    // recompile=false: the block stays resident and unmarked.
    assert_eq!(h.space.get(loc(0x5000)), Some(entry));
    assert_eq!(h.space.fastmem_manager().marker_count(), 0);
}

#[test]
fn test_fastmem_fault_with_recompile_takes_slow_path() {
    let mut h = Harness::new(8 * 1024 * 1024, EmitConfig::default());

    h.script(
        0x6000,
        BlockScript {
            terminal: Terminal::ReturnToDispatch,
            directives: vec![
                Directive::FastmemSite { recompile: true },
                Directive::PreludeReloc(LinkTarget::ReturnToDispatcher),
            ],
        },
    );

    let entry = h.space.get_or_emit(loc(0x6000));
    h.space.fastmem_callback(entry.addr() as u64);

    // The faulting block got invalidated and its site banned.
    assert_eq!(h.space.get(loc(0x6000)), None);
    let marker = DoNotFastmemMarker {
        location: loc(0x6000),
        offset: 0,
    };
    assert!(!h.space.fastmem_manager().should_fastmem(marker));

    // Recompilation picks the out-of-line sequence: no recovery site left.
    let entry2 = h.space.get_or_emit(loc(0x6000));
    let info = h.space.block_info(entry2).unwrap();
    assert!(info.fastmem_patch_info.is_empty());
}

#[test]
#[should_panic(expected = "fastmem patch site")]
fn test_fault_outside_patch_sites_is_fatal() {
    let mut h = Harness::new(8 * 1024 * 1024, EmitConfig::default());
    let entry = h.space.get_or_emit(loc(0x7000));
    // Offset 0 of this block carries no fastmem site.
    h.space.fastmem_callback(entry.addr() as u64);
}
