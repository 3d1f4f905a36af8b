// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! # ARM-M timer
//!
//! We use the system tick timer as the slice timer. Each time a round-robin
//! task is dispatched, SysTick is loaded with exactly that task's remaining
//! budget and counts down once per processor clock; if it reaches zero, the
//! slice is over. FIFO tasks run with the counter going round its full
//! range, and the interrupt only counts the wraps, so we can still tell how
//! long they ran.
//!
//! # Notes on ARM-M interrupts
//!
//! The kernel is entered through a handful of exception handlers:
//!
//! - `SVCall` implements the `SVC` instruction used by the call gate.
//! - `SysTick` notices the end of a slice.
//! - `PendSV` handles deferred context switches.
//! - `MemoryManagement`, `BusFault` and `UsageFault` catch task faults.
//!
//! On any exception, the processor stacks a small subset of machine state
//! (the hardware frame) on the interrupted task's stack and calls our
//! handler. That's great if we return to the same code, but a context switch
//! needs the rest of the task's registers put somewhere it can find them
//! again. So the handlers that may switch push the remaining registers (the
//! software frame) onto the task's stack right below the hardware frame, hand
//! the resulting stack pointer to the kernel, and pop whatever software frame
//! sits at the stack pointer the kernel hands back.
//!
//! `SysTick` doesn't do any of that. It runs as a normal Rust function and,
//! if the slice really is over, sets `PendSV` pending. `PendSV` kicks in when
//! `SysTick` returns, and performs the full save/restore sequence around the
//! scheduler.
//!
//! All of these run at the same, lowest, exception priority, so they can't
//! preempt each other, and the kernel is never reentered. Faults run at the
//! highest configurable priority, so that faults in the kernel are caught.

use core::arch::{self, global_asm};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use abi::{FaultInfo, FaultSource, GateError, GateOp};
use kerncore::RegionDesc;

use crate::fail;
use crate::frame;
use crate::gate::Platform;
use crate::mpu::ProtectionUnit;
use crate::profiling;
use crate::sched::{self, SliceTimer, TickMode};
use crate::startup::{with_kernel, HAS_FPU};

pub type Hardware = CortexM;

/// Runtime block of the running task, for the task runtime's benefit.
#[no_mangle]
static CURRENT_REENT: AtomicUsize = AtomicUsize::new(0);

/// Part of the running task's stack the entry sequence may push its software
/// frame into. Nothing else is written on a task's behalf.
static STACK_FLOOR: AtomicUsize = AtomicUsize::new(0);
static STACK_TOP: AtomicUsize = AtomicUsize::new(0);

/// Set by `SysTick` when the slice ran out, until the switch picks it up.
static SLICE_EXPIRED: AtomicBool = AtomicBool::new(false);

/// Set while a FIFO task runs: `SysTick` counts wraps into `FIFO_WRAPS`
/// instead of ending the slice.
static COUNTING_WRAPS: AtomicBool = AtomicBool::new(false);
static FIFO_WRAPS: AtomicU32 = AtomicU32::new(0);

const SYST_ENABLE: u32 = 1 << 0;
const SYST_TICKINT: u32 = 1 << 1;
const SYST_CLKSOURCE: u32 = 1 << 2;
const SYST_COUNTFLAG: u32 = 1 << 16;

/// The SysTick counter is 24 bits.
const SYST_MAX_LOAD: u32 = 1 << 24;

const MPU_ENABLE: u32 = 0b001;
const MPU_PRIVDEFENA: u32 = 0b100;

/// The processor's own peripherals, as the kernel drives them.
pub struct CortexM {
    /// Counts the slice timer was last loaded with.
    load: u32,
    /// The timer is only counting for a FIFO task, not bounding a slice.
    counting: bool,
}

impl CortexM {
    /// # Safety
    ///
    /// There must only be one of these, and nothing else may touch the MPU,
    /// SysTick or NVIC enable registers.
    pub unsafe fn take() -> Self {
        Self {
            load: 0,
            counting: false,
        }
    }

    fn mpu(&self) -> &'static cortex_m::peripheral::mpu::RegisterBlock {
        // Safety: we're manufacturing authority to touch the MPU here, which
        // the contract on `take` makes ours alone.
        unsafe { &*cortex_m::peripheral::MPU::PTR }
    }

    fn syst(&self) -> &'static cortex_m::peripheral::syst::RegisterBlock {
        // Safety: as for `mpu`.
        unsafe { &*cortex_m::peripheral::SYST::PTR }
    }
}

impl ProtectionUnit for CortexM {
    fn region_count(&self) -> usize {
        // DREGION, in MPU_TYPE bits 15:8.
        ((self.mpu()._type.read() >> 8) & 0xFF) as usize
    }

    fn enable(&mut self) {
        // Safety: this has no memory safety implications. The worst it can do
        // is cause us to fault, which is safe. The register API doesn't know
        // this.
        unsafe {
            self.mpu().ctrl.write(MPU_ENABLE | MPU_PRIVDEFENA);
        }
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }

    fn disable(&mut self) {
        cortex_m::asm::dmb();
        // Safety: as above.
        unsafe {
            self.mpu().ctrl.write(0);
        }
    }

    fn is_enabled(&self) -> bool {
        self.mpu().ctrl.read() & MPU_ENABLE != 0
    }

    fn apply_region(&mut self, slot: usize, region: &RegionDesc) {
        let mpu = self.mpu();
        // Safety: we're messing with memory protection, so from the API's
        // point of view this is very unsafe. But privileged code keeps the
        // default map, so only tasks are affected. The region is switched
        // off while its base moves, so it never covers a mixture of old and
        // new.
        unsafe {
            mpu.rnr.write(slot as u32);
            mpu.rasr.write(0);
            mpu.rbar.write(region.rbar);
            mpu.rasr.write(region.rasr);
        }
    }
}

impl SliceTimer for CortexM {
    fn take_elapsed(&mut self) -> u32 {
        let syst = self.syst();
        // Reading CSR clears COUNTFLAG, so a wrap seen here won't be counted
        // again by `SysTick`.
        let wrapped = syst.csr.read() & SYST_COUNTFLAG != 0;
        if SLICE_EXPIRED.swap(false, Ordering::Relaxed) {
            // The counter was stopped when the slice ran out.
            return self.load;
        }
        let wraps = FIFO_WRAPS.swap(0, Ordering::Relaxed) + u32::from(wrapped);
        if !self.counting && wraps != 0 {
            // Ran out, and SysTick hasn't had a chance to notice.
            return self.load;
        }
        sched::counts_elapsed(self.load, wraps, syst.cvr.read())
    }

    fn arm(&mut self, mode: TickMode) {
        // FIFO tasks get the interrupt too, but only to count wraps.
        let (load, counting) = match mode {
            TickMode::Armed(n) => (n.clamp(1, SYST_MAX_LOAD), false),
            TickMode::Disabled => (SYST_MAX_LOAD, true),
        };
        self.load = load;
        self.counting = counting;
        COUNTING_WRAPS.store(counting, Ordering::Relaxed);
        FIFO_WRAPS.store(0, Ordering::Relaxed);
        let syst = self.syst();
        // Safety: this, too, is safe in practice but unsafe in API.
        unsafe {
            syst.csr.write(0);
            syst.rvr.write(load - 1);
            // Clears the counter and COUNTFLAG.
            syst.cvr.write(0);
            syst.csr.write(SYST_ENABLE | SYST_TICKINT | SYST_CLKSOURCE);
        }
        SLICE_EXPIRED.store(false, Ordering::Relaxed);
    }
}

impl Platform for CortexM {
    fn set_irq_enabled(&mut self, irq: u32, on: bool) -> Result<(), GateError> {
        let nvic = unsafe { &*cortex_m::peripheral::NVIC::PTR };
        let reg_num = (irq / 32) as usize;
        let bit_mask = 1 << (irq % 32);
        let reg = if on {
            nvic.iser.get(reg_num)
        } else {
            nvic.icer.get(reg_num)
        };
        // Safety: set/clear registers only touch the named interrupt.
        unsafe {
            reg.ok_or(GateError::BadIrq)?.write(bit_mask);
        }
        Ok(())
    }

    fn reset(&mut self) -> ! {
        cortex_m::peripheral::SCB::sys_reset()
    }

    fn restore_trampoline(&self) -> u32 {
        extern "C" {
            fn kern_restore_trampoline();
        }
        kern_restore_trampoline as usize as u32
    }

    fn translate(&self, addr: u32, len: usize) -> Option<usize> {
        addr.checked_add(u32::try_from(len).ok()?)?;
        Some(addr as usize)
    }

    fn publish_reentrancy(&mut self, reent: usize) {
        CURRENT_REENT.store(reent, Ordering::Relaxed);
    }

    fn publish_stack(&mut self, floor: usize, top: usize) {
        STACK_FLOOR.store(floor, Ordering::Relaxed);
        STACK_TOP.store(top, Ordering::Relaxed);
    }
}

// Injected calls return here. It lives in kernel code, which every task may
// execute, and issues the restore operation.
global_asm! {"
    .section .text.kern_restore_trampoline
    .globl kern_restore_trampoline
    .type kern_restore_trampoline,function
    .thumb_func
    kern_restore_trampoline:
        movs r0, #{restore}
        svc #0
        udf #0
    ",
    restore = const GateOp::Restore as u32,
}

/// Enters the first task, whose saved stack pointer is `sp`.
pub fn start_first_task(sp: usize) -> ! {
    // Enable faults and set fault/exception priorities to reasonable settings.
    // Our goal here is to keep the kernel non-preemptive, which means the
    // kernel entry points (SVCall, PendSV, SysTick) must be at one priority
    // level. Fault handlers need to be higher priority, however, so that we
    // can detect faults in the kernel.
    //
    // Safety: we're purely lowering priorities from their defaults, so it
    // can't cause any surprise preemption. But these operations are `unsafe`
    // in the `cortex_m` crate.
    unsafe {
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // MEMFAULT, BUSFAULT, USGFAULT on, so they're told apart from
        // HardFault.
        scb.shcsr.modify(|x| x | 0b111 << 16);

        // Usage, Bus, MemManage at 0 (highest configurable).
        scb.shpr[0].write(0x00);
        scb.shpr[1].write(0x00);
        scb.shpr[2].write(0x00);
        // SVCall, SysTick and PendSV at 0xFF (lowest configurable).
        scb.shpr[7].write(0xFF);
        scb.shpr[10].write(0xFF);
        scb.shpr[11].write(0xFF);

        // Trap on division by zero instead of quietly returning 0.
        const DIV_0_TRP: u32 = 1 << 4;
        scb.ccr.modify(|x| x | DIV_0_TRP);

        if HAS_FPU {
            // Full access to CP10 and CP11.
            scb.cpacr.modify(|x| x | 0b1111 << 20);
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
        }

        // External interrupts can't preempt the kernel either.
        let nvic = &*cortex_m::peripheral::NVIC::PTR;
        let icb = &*cortex_m::peripheral::ICB::PTR;
        // Interrupt count in blocks of 32, minus 1.
        let irq_count = ((icb.ictr.read() as usize & 0xF) + 1) * 32;
        for i in 0..irq_count {
            nvic.ipr[i].write(0xFFu8);
        }
    }

    // Safety: this is setting the Process (task) stack pointer, which has no
    // effect _assuming_ this code is running on the Main (kernel) stack.
    unsafe {
        cortex_m::register::psp::write(sp as u32);
    }

    // Our basic goal here is to flip into Handler mode so that we can switch
    // Thread mode to unprivileged and running off the Process Stack Pointer.
    // The easiest way to do this on ARM-M is by entering Handler mode by a
    // trap. The SVCall entry sequence detects this and pops the first task's
    // software frame instead of treating it as a gate call.
    unsafe {
        arch::asm!(
            "svc #0xFF",
            options(noreturn),
        )
    }
}

// The gate, the deferred switch and the configurable faults share an exit
// sequence: pop the software frame at r0, and FP state if its EXC_RETURN
// says there is some, then resume.
//
// The entry sequence writes with the kernel's privileges, wherever the task
// left PSP. So before pushing anything it asks `sw_frame_allowed` whether the
// frame stays on the task's own stack, and branches to the `2:` that follows
// its handler if not. r0-r3 and r12 are in the hardware frame already; LR is
// kept on the main stack over the call.
macro_rules! check_psp {
    () => {"
        mrs r0, PSP
        mov r1, lr
        push {{r0, lr}}
        bl sw_frame_allowed
        mov r1, r0
        pop {{r0, lr}}
        cmp r1, #0
        beq 2f
    "};
}

// Where a refused save ends up: the task is faulted without anything being
// written, and someone else resumes.
macro_rules! refuse_save {
    () => {"
    2:  mrs r0, PSP
        bl sw_frame_refused
    "};
}

cfg_if::cfg_if! {
    if #[cfg(has_fpu)] {
        macro_rules! save_sw_frame {
            () => {"
                tst lr, #0x10
                it eq
                vstmdbeq r0!, {{s16-s31}}
                stmdb r0!, {{r4-r11, lr}}
            "};
        }
        macro_rules! restore_sw_frame {
            () => {"
                ldmia r0!, {{r4-r11, lr}}
                tst lr, #0x10
                it eq
                vldmiaeq r0!, {{s16-s31}}
                msr PSP, r0
                bx lr
            "};
        }
    } else {
        macro_rules! save_sw_frame {
            () => {"
                stmdb r0!, {{r4-r11, lr}}
            "};
        }
        macro_rules! restore_sw_frame {
            () => {"
                ldmia r0!, {{r4-r11, lr}}
                msr PSP, r0
                bx lr
            "};
        }
    }
}

global_asm! {
    concat!("
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    .thumb_func
    SVCall:
        @ Inspect LR to figure out the caller's mode.
        mov r0, lr
        mov r1, #0xFFFFFFF3
        bic r0, r1
        @ Is the call coming from thread mode + main stack, i.e.
        @ from the kernel startup routine?
        cmp r0, #0x8
        @ If so, this is startup; jump ahead.
        beq 1f
    ",
    check_psp!(),
    save_sw_frame!(),
    "
        bl svc_entry
    ",
    restore_sw_frame!(),
    refuse_save!(),
    restore_sw_frame!(),
    "
    1:  @ starting up the first task.
        movs r0, #1         @ get bitmask to...
        msr CONTROL, r0     @ ...shed privs from thread mode.
                            @ note: no barrier here because exc return
                            @ serves as barrier
        mrs r0, PSP
    ",
    restore_sw_frame!(),
    "
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    .thumb_func
    PendSV:
    ",
    check_psp!(),
    save_sw_frame!(),
    "
        bl pendsv_entry
    ",
    restore_sw_frame!(),
    refuse_save!(),
    restore_sw_frame!(),
    "
    .section .text.configurable_fault
    .globl configurable_fault
    .type configurable_fault,function
    .thumb_func
    configurable_fault:
        @ Nothing is pushed onto the task's stack: it may well be the reason
        @ we're here. Pass the fault number from IPSR, EXC_RETURN, and PSP.
        mrs r0, IPSR
        and r0, r0, #0xf
        mov r1, lr
        mrs r2, PSP
        bl handle_fault
    ",
    restore_sw_frame!(),
    "
    .section .text.MemoryManagement
    .globl MemoryManagement
    .type MemoryManagement,function
    .thumb_func
    MemoryManagement:
        b configurable_fault

    .section .text.BusFault
    .globl BusFault
    .type BusFault,function
    .thumb_func
    BusFault:
        b configurable_fault

    .section .text.UsageFault
    .globl UsageFault
    .type UsageFault,function
    .thumb_func
    UsageFault:
        b configurable_fault

    .section .text.HardFault
    .globl HardFault
    .type HardFault,function
    .thumb_func
    HardFault:
        b hard_fault_entry
    ")
}

/// The Rust side of the SVCall handler. Takes and returns the saved stack
/// pointer.
#[no_mangle]
unsafe extern "C" fn svc_entry(sp: usize) -> usize {
    with_kernel(|k| k.gate(sp))
}

/// Called by the entry sequence, before it saves anything, with the task's
/// PSP and EXC_RETURN.
#[no_mangle]
extern "C" fn sw_frame_allowed(psp: usize, exc_return: u32) -> bool {
    frame::sw_frame_fits(
        psp,
        exc_return,
        STACK_FLOOR.load(Ordering::Relaxed),
        STACK_TOP.load(Ordering::Relaxed),
    )
}

/// Where the entry sequence goes when the task's PSP leaves no room for the
/// software frame on its stack. The task is faulted, just as if the
/// hardware had run out of stack, and never sees the operation it asked for.
#[no_mangle]
unsafe extern "C" fn sw_frame_refused(psp: u32) -> usize {
    let fault = FaultInfo::StackOverflow { address: psp };
    with_kernel(|k| k.fault_current(fault))
}

/// The Rust side of the PendSV handler, after all volatile registers have
/// been saved on the task's stack.
#[no_mangle]
unsafe extern "C" fn pendsv_entry(sp: usize) -> usize {
    profiling::event_switch_enter();
    let next = with_kernel(|k| k.switch(sp));
    profiling::event_switch_exit();
    next
}

/// Handler that gets linked into the vector table for the System Tick Timer
/// overflow interrupt.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    profiling::event_tick_isr_enter();
    // Safety: reading and stopping the timer we own.
    let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
    // Only a real count to zero counts. If the kernel has read CSR since, it
    // has already accounted for it.
    let counted_down = syst.csr.read() & SYST_COUNTFLAG != 0;
    if counted_down && COUNTING_WRAPS.load(Ordering::Relaxed) {
        FIFO_WRAPS.fetch_add(1, Ordering::Relaxed);
    } else if counted_down {
        SLICE_EXPIRED.store(true, Ordering::Relaxed);
        unsafe {
            syst.csr.modify(|v| v & !(SYST_ENABLE | SYST_TICKINT));
        }
        // This sets the bit to pend a PendSV interrupt. PendSV will happen
        // after this ISR returns, and perform the context switch.
        cortex_m::peripheral::SCB::set_pendsv();
    }
    profiling::event_tick_isr_exit();
}

#[no_mangle]
extern "C" fn hard_fault_entry() -> ! {
    // Safety: shared reference to a static register block.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    fail::die(HardFault {
        hfsr: scb.hfsr.read(),
        cfsr: scb.cfsr.read(),
    })
}

struct HardFault {
    hfsr: u32,
    cfsr: u32,
}

impl core::fmt::Display for HardFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "HardFault: HFSR={:#010x} CFSR={:#010x}",
            self.hfsr, self.cfsr,
        )
    }
}

#[repr(u32)]
enum FaultType {
    MemoryManagement = 4,
    BusFault = 5,
    UsageFault = 6,
}

impl FaultType {
    fn from_ipsr(n: u32) -> Option<Self> {
        match n {
            4 => Some(Self::MemoryManagement),
            5 => Some(Self::BusFault),
            6 => Some(Self::UsageFault),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register.
    #[derive(Copy, Clone, Debug)]
    #[repr(transparent)]
    struct Cfsr: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        // MMFSR bit 2 reserved
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        // MMFSR bit 6 reserved
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        // BFSR bit 6 reserved
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);
        // UFSR bits 4-7 reserved
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);
        // UFSR bits 10-31 reserved
    }
}

/// Common implementation of fault handling. Returns the saved stack pointer
/// of the task to resume.
///
/// # Safety
///
/// Call this on the way into the kernel from the fault entry sequence, not
/// from within the kernel Rust code.
#[no_mangle]
unsafe extern "C" fn handle_fault(
    fault_type: u32,
    exc_return: u32,
    psp: u32,
) -> usize {
    // Safety: this is dereferencing the raw pointer produced by SCB::PTR. The
    // resulting reference is to a static-scoped Sync thing, and it's a shared
    // reference.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let cfsr = Cfsr::from_bits_truncate(scb.cfsr.read());

    let from_thread_mode = exc_return & 0b1000 != 0;
    let fault_type = match FaultType::from_ipsr(fault_type) {
        Some(t) if from_thread_mode => t,
        _ => {
            // This fault originates from the kernel.
            panic!(
                "Kernel fault {}: CFSR={:#010x}, MMFAR={:#010x}, \
                 BFAR={:#010x}",
                fault_type,
                cfsr.bits(),
                scb.mmfar.read(),
                scb.bfar.read(),
            );
        }
    };

    // A fault taken while stacking for another exception leaves that other
    // exception pending; if we don't clear it, it'll look like the next task
    // raised it. Those pended bits are SHCSR 15:12.
    //
    // Safety: the main risk here would be if SVC were higher priority than
    // this handler, which it is not.
    unsafe {
        scb.shcsr.modify(|bits| bits & !(0b1111 << 12));
    }

    let fault = match fault_type {
        FaultType::MemoryManagement => {
            if cfsr.contains(Cfsr::MSTKERR) {
                FaultInfo::StackOverflow { address: psp }
            } else if cfsr.contains(Cfsr::IACCVIOL) {
                FaultInfo::IllegalText
            } else {
                FaultInfo::MemoryAccess {
                    address: cfsr
                        .contains(Cfsr::MMARVALID)
                        .then(|| scb.mmfar.read()),
                    source: FaultSource::User,
                }
            }
        }
        FaultType::BusFault => FaultInfo::BusError {
            address: cfsr.contains(Cfsr::BFARVALID).then(|| scb.bfar.read()),
            source: FaultSource::User,
        },
        FaultType::UsageFault => {
            if cfsr.contains(Cfsr::DIVBYZERO) {
                FaultInfo::DivideByZero
            } else if cfsr.contains(Cfsr::UNDEFINSTR) {
                FaultInfo::IllegalInstruction
            } else {
                FaultInfo::InvalidOperation(cfsr.bits())
            }
        }
    };

    // CFSR is write-one-to-clear.
    //
    // Safety: this only clears recorded fault states.
    unsafe {
        scb.cfsr.write(cfsr.bits());
    }

    #[cfg(has_fpu)]
    {
        // The faulting task may have FP state waiting to be lazily stacked on
        // a stack we can't trust. Drop it, so that restoring the next task's
        // FP registers doesn't try.
        const LSPACT: u32 = 1 << 0;
        unsafe {
            let fpu = &*cortex_m::peripheral::FPU::PTR;
            fpu.fpccr.modify(|x| x & !LSPACT);
        }
    }

    with_kernel(|k| k.fault_current(fault))
}
