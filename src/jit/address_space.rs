//! The code cache / address space.
//!
//! Maps guest locations to emitted host entry points, compiles on miss,
//! patches inter-block branches as blocks come and go, and answers the
//! fault handler's "which fastmem site is this?" question. All emission
//! happens on one thread; see the crate docs for the W^X contract.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::marker::PhantomData;

use crate::config::EmitConfig;
use crate::ir::{self, LocationDescriptor, Terminal};

use super::codebuf::CodeWriter;
use super::exception::{self, ExceptionHandler, FakeCall};
use super::fastmem::FastmemManager;
use super::link::{self, EmittedBlockInfo, LinkTarget, PreludeInfo};
use super::memory::{ArenaError, ExecutableArena};
use super::prelude::{build_prelude, RuntimeCallbacks};
use super::state::JitState;
use super::CodePtr;

/// The host-code emitter. Writes instructions at the cursor, advances it,
/// and reports entry point, size, and the relocation/fastmem tables.
pub trait BlockEmitter {
    fn emit(
        &mut self,
        code: &mut CodeWriter,
        block: ir::Block,
        config: &EmitConfig,
        fastmem: &FastmemManager,
    ) -> EmittedBlockInfo;
}

/// Produces an IR block for a guest location on cache miss.
pub type IrProducer = Box<dyn FnMut(LocationDescriptor) -> ir::Block>;

/// Notified of every freshly emitted block (profilers, unwinders).
pub type NewBlockHook = Box<dyn FnMut(LocationDescriptor, &EmittedBlockInfo)>;

/// Compilation stops (and the cache is reset on the next request) when
/// less than this much arena remains.
const NEARLY_FULL_MARGIN: usize = 1024 * 1024;

const MAX_CACHE_SIZE: usize = 128 * 1024 * 1024;

pub struct AddressSpace {
    emit_config: EmitConfig,
    code_cache_size: usize,
    // Declared before the arena so the fault-handler registration is torn
    // down before the mapping disappears.
    _exception_handler: ExceptionHandler,
    mem: ExecutableArena,
    code: CodeWriter,
    prelude_info: PreludeInfo,
    fastmem_manager: FastmemManager,

    block_entries: HashMap<LocationDescriptor, CodePtr>,
    reverse_block_entries: BTreeMap<CodePtr, LocationDescriptor>,
    block_infos: HashMap<CodePtr, EmittedBlockInfo>,
    /// For every target descriptor, the blocks holding a branch slot to it.
    block_references: HashMap<LocationDescriptor, HashSet<CodePtr>>,

    ir_producer: IrProducer,
    emitter: Box<dyn BlockEmitter>,
    new_block_hook: Option<NewBlockHook>,
}

impl AddressSpace {
    pub fn new(
        emit_config: EmitConfig,
        code_cache_size: usize,
        callbacks: &RuntimeCallbacks,
        ir_producer: IrProducer,
        emitter: Box<dyn BlockEmitter>,
    ) -> Result<Self, ArenaError> {
        assert!(
            code_cache_size <= MAX_CACHE_SIZE,
            "code_cache_size > 128 MiB not currently supported"
        );

        let mut mem = ExecutableArena::new(code_cache_size)?;
        let code_cache_size = mem.size();
        let mut code = CodeWriter::new(&mem);
        let prelude_info = build_prelude(&mut code, callbacks);
        mem.invalidate(mem.ptr(), code.offset());
        mem.protect();

        let mut exception_handler = ExceptionHandler::new();
        if let Err(e) = exception_handler.register(mem.ptr(), mem.size()) {
            log::warn!("fault handler not registered ({e}); fastmem recovery disabled");
        }

        Ok(AddressSpace {
            emit_config,
            code_cache_size,
            mem,
            code,
            prelude_info,
            _exception_handler: exception_handler,
            fastmem_manager: FastmemManager::new(),
            block_entries: HashMap::new(),
            reverse_block_entries: BTreeMap::new(),
            block_infos: HashMap::new(),
            block_references: HashMap::new(),
            ir_producer,
            emitter,
            new_block_hook: None,
        })
    }

    pub fn set_new_block_hook(&mut self, hook: NewBlockHook) {
        self.new_block_hook = Some(hook);
    }

    pub fn prelude_info(&self) -> &PreludeInfo {
        &self.prelude_info
    }

    pub fn fastmem_manager(&self) -> &FastmemManager {
        &self.fastmem_manager
    }

    /// Entry point for `descriptor`, if resident.
    pub fn get(&self, descriptor: LocationDescriptor) -> Option<CodePtr> {
        self.block_entries.get(&descriptor).copied()
    }

    /// The greatest block entry point at or below `host_pc`.
    pub fn reverse_get_entry_point(&self, host_pc: CodePtr) -> Option<CodePtr> {
        self.reverse_block_entries
            .range(..=host_pc)
            .next_back()
            .map(|(entry, _)| *entry)
    }

    /// The descriptor whose block covers (or most recently started before)
    /// `host_pc`.
    pub fn reverse_get_location(&self, host_pc: CodePtr) -> Option<LocationDescriptor> {
        self.reverse_block_entries
            .range(..=host_pc)
            .next_back()
            .map(|(_, location)| *location)
    }

    pub fn get_or_emit(&mut self, descriptor: LocationDescriptor) -> CodePtr {
        if let Some(block_entry) = self.get(descriptor) {
            return block_entry;
        }

        if self.is_nearly_full() {
            self.clear_cache();
        }

        self.compile(descriptor)
    }

    /// Remove the given descriptors' blocks after guest self-modification.
    ///
    /// References into each block are unlinked *before* the forward entry
    /// is removed: this can run from inside a fastmem callback while the
    /// invalidated block is still on the host stack, and the block may
    /// reference itself.
    pub fn invalidate_basic_blocks(&mut self, descriptors: &HashSet<LocationDescriptor>) {
        self.mem.unprotect();

        for descriptor in descriptors {
            if !self.block_entries.contains_key(descriptor) {
                continue;
            }

            self.relink_for_descriptor(*descriptor, None);
            self.block_entries.remove(descriptor);
        }

        // The reverse and info maps are deliberately retained: the fault
        // handler still needs to localise faults inside the dead bytes,
        // which stay in place until the next ClearCache.
        self.mem.protect();
    }

    /// Wholesale reset: drop every block (including the reverse/info
    /// entries retained for dead blocks) and rewind the cursor to the end
    /// of the prelude. Fastmem markers survive.
    pub fn clear_cache(&mut self) {
        log::debug!(
            "clearing code cache ({} blocks, {} bytes used)",
            self.block_entries.len(),
            self.code.ptr().offset_from(self.mem.ptr())
        );
        self.block_entries.clear();
        self.reverse_block_entries.clear();
        self.block_infos.clear();
        self.block_references.clear();
        self.code.set_ptr(self.prelude_info.end_of_prelude);
    }

    pub fn remaining_size(&self) -> usize {
        self.code_cache_size - self.code.ptr().offset_from(self.mem.ptr())
    }

    pub fn is_nearly_full(&self) -> bool {
        self.remaining_size() < NEARLY_FULL_MARGIN
    }

    /// Current write cursor (diagnostics and tests).
    pub fn code_ptr(&self) -> CodePtr {
        self.code.ptr()
    }

    fn compile(&mut self, descriptor: LocationDescriptor) -> CodePtr {
        let starting_position = self.code.ptr();

        self.mem.unprotect();

        let mut next = VecDeque::new();
        let result = self.emit_block(descriptor, &mut next);

        if self.emit_config.multi_block_compilation {
            while let Some(n) = next.pop_front() {
                if self.is_nearly_full() {
                    break;
                }
                if self.get(n).is_none() {
                    self.emit_block(n, &mut next);
                }
            }
        }

        self.mem.invalidate(
            starting_position,
            self.code.ptr().offset_from(starting_position),
        );
        self.mem.protect();

        result
    }

    fn emit_block(
        &mut self,
        descriptor: LocationDescriptor,
        next: &mut VecDeque<LocationDescriptor>,
    ) -> CodePtr {
        let ir_block = (self.ir_producer)(descriptor);
        debug_assert_eq!(ir_block.location(), descriptor);
        append_next_blocks(next, ir_block.terminal());

        let block_info = self.emitter.emit(
            &mut self.code,
            ir_block,
            &self.emit_config,
            &self.fastmem_manager,
        );
        let entry_point = block_info.entry_point;
        log::trace!("emitted block {descriptor} at {entry_point} ({} bytes)", block_info.size);

        assert!(
            self.block_entries.insert(descriptor, entry_point).is_none(),
            "duplicate block entry for {descriptor}"
        );
        assert!(
            self.reverse_block_entries
                .insert(entry_point, descriptor)
                .is_none(),
            "duplicate reverse entry at {entry_point}"
        );

        self.link(&block_info);

        assert!(
            self.block_infos.insert(entry_point, block_info).is_none(),
            "duplicate block info at {entry_point}"
        );

        // Blocks emitted earlier may already hold slots waiting for this
        // descriptor; point them at the fresh entry.
        self.relink_for_descriptor(descriptor, Some(entry_point));

        if let Some(hook) = &mut self.new_block_hook {
            let info = &self.block_infos[&entry_point];
            hook(descriptor, info);
        }

        entry_point
    }

    /// Resolve every relocation the emitter left in `block_info`.
    fn link(&mut self, block_info: &EmittedBlockInfo) {
        for relocation in &block_info.relocations {
            link::patch_relocation(block_info.entry_point, relocation, &self.prelude_info);
        }

        for (target_descriptor, list) in &block_info.block_relocations {
            self.block_references
                .entry(*target_descriptor)
                .or_default()
                .insert(block_info.entry_point);
            let target_ptr = self.get(*target_descriptor);
            link::link_block_links(
                block_info.entry_point,
                target_ptr,
                list,
                self.prelude_info.helper(LinkTarget::ReturnToDispatcher),
            );
        }
    }

    /// Re-patch every slot that targets `target_descriptor`. `None` routes
    /// the slots through the dispatcher. The arena must be unprotected.
    fn relink_for_descriptor(
        &self,
        target_descriptor: LocationDescriptor,
        target_ptr: Option<CodePtr>,
    ) {
        let Some(references) = self.block_references.get(&target_descriptor) else {
            return;
        };

        for code_ptr in references {
            if let Some(block_info) = self.block_infos.get(code_ptr) {
                if let Some(list) = block_info.block_relocations.get(&target_descriptor) {
                    link::link_block_links(
                        block_info.entry_point,
                        target_ptr,
                        list,
                        self.prelude_info.helper(LinkTarget::ReturnToDispatcher),
                    );
                }

                self.mem.invalidate(block_info.entry_point, block_info.size);
            }
        }
    }

    /// Map a faulting host PC to its recovery descriptor.
    ///
    /// A fault anywhere but a recorded fastmem patch site means emitted
    /// code or the cache state is corrupt; continuing would silently
    /// diverge the guest, so it is fatal.
    pub fn fastmem_callback(&mut self, host_pc: u64) -> FakeCall {
        fn fail(host_pc: u64) -> ! {
            log::error!("segfault in emitted code at host_pc = {host_pc:#018x}");
            panic!("segfault at {host_pc:#018x} was not at a fastmem patch site");
        }

        let host_ptr = CodePtr::new(host_pc as usize);

        let Some(entry_point) = self.reverse_get_entry_point(host_ptr) else {
            fail(host_pc);
        };
        let Some(block_info) = self.block_infos.get(&entry_point) else {
            fail(host_pc);
        };
        let Some(patch_entry) = block_info
            .fastmem_patch_info
            .get(&host_ptr.offset_from(entry_point))
        else {
            fail(host_pc);
        };

        let fake_call = patch_entry.fake_call;
        let recompile = patch_entry.recompile;
        let marker = patch_entry.marker;

        if recompile {
            self.fastmem_manager.mark_do_not_fastmem(marker);
            let mut invalidate = HashSet::new();
            invalidate.insert(marker.location);
            self.invalidate_basic_blocks(&invalidate);
        }

        fake_call
    }

    /// Publish this cache as the fault-recovery target for the duration of
    /// the returned scope. Guest execution must happen inside such a scope
    /// for fastmem faults to be recoverable.
    pub fn fastmem_scope(&mut self) -> FastmemScope<'_> {
        unsafe fn hook(ctx: *mut (), host_pc: u64) -> FakeCall {
            (*(ctx as *mut AddressSpace)).fastmem_callback(host_pc)
        }

        let guard = unsafe { exception::publish_fastmem_hook(self as *mut _ as *mut (), hook) };
        FastmemScope {
            _guard: guard,
            _marker: PhantomData,
        }
    }

    /// Enter guest execution at `entry` with fault recovery published.
    ///
    /// # Safety
    /// `entry` must be a live block entry point and `state` a valid guest
    /// context for it.
    pub unsafe fn run(&mut self, state: *mut JitState, entry: CodePtr) -> u64 {
        let run_code = self.prelude_info.run_code_fn();
        let _scope = self.fastmem_scope();
        run_code(state, entry.as_ptr())
    }

    // Read-only views for diagnostics, profilers and tests.

    pub fn block_entries(&self) -> impl Iterator<Item = (LocationDescriptor, CodePtr)> + '_ {
        self.block_entries.iter().map(|(l, p)| (*l, *p))
    }

    pub fn block_info(&self, entry_point: CodePtr) -> Option<&EmittedBlockInfo> {
        self.block_infos.get(&entry_point)
    }

    pub fn references_to(&self, descriptor: LocationDescriptor) -> Option<&HashSet<CodePtr>> {
        self.block_references.get(&descriptor)
    }
}

/// Queue the compile-worthy successors of `terminal`.
///
/// Closed match over the terminal variants: hints and dispatcher returns
/// queue nothing, links queue their target, the conditional forms recurse.
fn append_next_blocks(next: &mut VecDeque<LocationDescriptor>, terminal: &Terminal) {
    match terminal {
        Terminal::Invalid => panic!("invalid terminal"),
        Terminal::ReturnToDispatch | Terminal::PopRsbHint | Terminal::FastDispatchHint => {}
        Terminal::LinkBlock(location) | Terminal::LinkBlockFast(location) => {
            next.push_back(*location);
        }
        Terminal::If { then_, else_, .. } => {
            append_next_blocks(next, then_);
            append_next_blocks(next, else_);
        }
        Terminal::CheckBit { then_, else_ } => {
            append_next_blocks(next, then_);
            append_next_blocks(next, else_);
        }
        Terminal::CheckHalt(else_) => append_next_blocks(next, else_),
    }
}

pub struct FastmemScope<'a> {
    _guard: exception::FastmemHookGuard,
    _marker: PhantomData<&'a mut AddressSpace>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Cond;

    fn loc(value: u64) -> LocationDescriptor {
        LocationDescriptor::new(value)
    }

    #[test]
    fn test_terminal_successors() {
        let mut next = VecDeque::new();
        append_next_blocks(&mut next, &Terminal::ReturnToDispatch);
        append_next_blocks(&mut next, &Terminal::PopRsbHint);
        append_next_blocks(&mut next, &Terminal::FastDispatchHint);
        assert!(next.is_empty());

        append_next_blocks(&mut next, &Terminal::LinkBlock(loc(1)));
        append_next_blocks(&mut next, &Terminal::LinkBlockFast(loc(2)));
        assert_eq!(next.iter().copied().collect::<Vec<_>>(), vec![loc(1), loc(2)]);
    }

    #[test]
    fn test_terminal_successors_recursive() {
        let mut next = VecDeque::new();
        append_next_blocks(
            &mut next,
            &Terminal::If {
                cond: Cond::Eq,
                then_: Box::new(Terminal::LinkBlock(loc(10))),
                else_: Box::new(Terminal::CheckHalt(Box::new(Terminal::LinkBlockFast(loc(
                    11,
                ))))),
            },
        );
        append_next_blocks(
            &mut next,
            &Terminal::CheckBit {
                then_: Box::new(Terminal::LinkBlock(loc(12))),
                else_: Box::new(Terminal::ReturnToDispatch),
            },
        );
        assert_eq!(
            next.iter().copied().collect::<Vec<_>>(),
            vec![loc(10), loc(11), loc(12)]
        );
    }

    #[test]
    #[should_panic(expected = "invalid terminal")]
    fn test_invalid_terminal_is_fatal() {
        let mut next = VecDeque::new();
        append_next_blocks(&mut next, &Terminal::Invalid);
    }
}
