//! The procedure state-machine framework.
//!
//! A procedure is a finite-state object with one entry point: `run(state,
//! input)`. The transaction owns a stack of procedures; only the top one
//! receives input. Pushing a sub-procedure records where the caller resumes
//! when the sub-procedure pops. A procedure reports what should happen next
//! through [`MachineStatus`]; the transaction's trampoline applies stack
//! operations, so a procedure never manipulates the stack it lives on.
//!
//! Inputs arrive as dispatch keys (see [`crate::l3`]): decoded-message keys,
//! primitive keys, dialog-state keys, and private states below 0x100 used
//! for timer expiries and sub-procedure resumption.

use crate::cause::{RrCause, TermCause};
use crate::channel::L3Channel;
use crate::l3::{DispatchKey, L3Frame, L3Message, Primitive, Sapi};
use crate::mm::MmContext;
use crate::services::Services;
use crate::sip::{DialogEvent, SipDialog};
use crate::timers::{TimerAction, TimerId};
use crate::tran::{CallState, TranInner, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// What a procedure tells the trampoline on return. Any error must map to
/// one of these.
#[derive(Debug)]
pub enum MachineStatus {
    /// Wait for the next input.
    Ok,
    /// Return control to the procedure below on the stack.
    PopMachine,
    /// Pop everything and destroy the transaction. The normal exit.
    QuitTran(TermCause),
    /// Drop the channel, killing every transaction on it.
    QuitChannel(TermCause),
    /// The input was not meaningful in this state. Logged and ignored; the
    /// GSM spec requires tolerance.
    UnexpectedState,
}

/// The input being dispatched.
#[derive(Debug, Clone, Copy)]
pub enum ProcInput<'a> {
    /// Timer expiry or sub-procedure resumption.
    None,
    /// A frame from the data link (primitive or data).
    Frame(&'a L3Frame),
    /// A decoded message delivered without its frame.
    Message(&'a L3Message),
    /// A dialog-state change from the SIP side.
    Dialog(&'a DialogEvent),
}

impl<'a> ProcInput<'a> {
    /// The decoded message, from either a Frame or Message input.
    pub fn message(&self) -> Option<&'a L3Message> {
        match *self {
            ProcInput::Message(m) => Some(m),
            ProcInput::Frame(f) => f.message(),
            _ => None,
        }
    }

    pub fn dialog(&self) -> Option<&'a DialogEvent> {
        match *self {
            ProcInput::Dialog(d) => Some(d),
            _ => None,
        }
    }
}

/// Deferred stack operation requested by the running procedure.
pub(crate) enum StackOp {
    Push {
        proc: Box<dyn Procedure>,
        resume_state: DispatchKey,
        start_state: DispatchKey,
    },
    Replace {
        proc: Box<dyn Procedure>,
        start_state: DispatchKey,
    },
}

/// One finite-state procedure.
pub trait Procedure: Send {
    /// Name for the log.
    fn name(&self) -> &'static str;

    /// Advance by one transition.
    fn run(&mut self, ctx: &mut ProcCtx<'_>, state: DispatchKey, input: ProcInput<'_>)
        -> MachineStatus;

    /// Called before the channel is pre-empted, so the procedure can do
    /// nicer cleanup than a bare channel drop.
    fn handle_termination_request(&mut self, _ctx: &mut ProcCtx<'_>) {}
}

/// Everything a procedure may touch while running: the transaction state
/// (locked for the duration of `run`), its channel, and the service
/// boundaries. The global MM lock is NOT held here.
pub struct ProcCtx<'a> {
    pub svc: &'a Services,
    pub tran: &'a Arc<Transaction>,
    pub inner: &'a mut TranInner,
    pub mmc: &'a Arc<MmContext>,
    pub chan: &'a Arc<L3Channel>,
    pub(crate) stack_op: Option<StackOp>,
}

impl<'a> ProcCtx<'a> {
    /// Send a message downlink on SAPI 0. May block in the data link.
    pub fn l3sendm(&self, msg: L3Message) {
        self.chan.l3send_msg(msg, Sapi::Sapi0);
    }

    pub fn l3sendm_sapi(&self, msg: L3Message, sapi: Sapi) {
        self.chan.l3send_msg(msg, sapi);
    }

    pub fn l3sendp(&self, prim: Primitive, sapi: Sapi) {
        self.chan.l3send_prim(prim, sapi);
    }

    /// Arm a timer with its default duration.
    pub fn timer_start(&mut self, id: TimerId, action: TimerAction) {
        self.inner.timers.start(id, id.default_duration(), action);
    }

    pub fn timer_start_dur(&mut self, id: TimerId, duration: Duration, action: TimerAction) {
        self.inner.timers.start(id, duration, action);
    }

    pub fn timer_stop(&mut self, id: TimerId) {
        self.inner.timers.stop(id);
    }

    pub fn timer_stop_all(&mut self) {
        self.inner.timers.stop_all();
    }

    pub fn gsm_state(&self) -> CallState {
        self.inner.gsm_state
    }

    pub fn set_gsm_state(&mut self, state: CallState) {
        self.inner.set_gsm_state(state);
    }

    pub fn dialog(&self) -> Option<Arc<dyn SipDialog>> {
        self.inner.dialog.clone()
    }

    pub fn set_dialog(&mut self, dialog: Arc<dyn SipDialog>) {
        self.inner.last_dialog_state = Some(dialog.state());
        self.inner.dialog = Some(dialog);
    }

    /// The L3 TI, with the direction bit as stored. Only valid if
    /// [`ti_valid`] is true.
    ///
    /// [`ti_valid`]: ProcCtx::ti_valid
    pub fn l3_ti(&self) -> u8 {
        self.inner.l3_ti.unwrap_or(0)
    }

    pub fn ti_valid(&self) -> bool {
        self.inner.l3_ti.is_some()
    }

    /// Push a sub-procedure; when it pops, this procedure resumes at
    /// `resume_state` with no input.
    pub fn machine_push(&mut self, proc: Box<dyn Procedure>, resume_state: DispatchKey)
        -> MachineStatus {
        self.stack_op = Some(StackOp::Push {
            proc,
            resume_state,
            start_state: 0,
        });
        MachineStatus::Ok
    }

    /// Replace the whole stack with a fresh procedure started at state 0.
    pub fn machine_start(&mut self, proc: Box<dyn Procedure>) -> MachineStatus {
        self.machine_start_at(proc, 0)
    }

    /// Replace the whole stack with a fresh procedure started at the given
    /// state.
    pub fn machine_start_at(
        &mut self,
        proc: Box<dyn Procedure>,
        start_state: DispatchKey,
    ) -> MachineStatus {
        self.stack_op = Some(StackOp::Replace { proc, start_state });
        MachineStatus::Ok
    }

    /// Send an RR ChannelRelease downlink and request channel teardown.
    pub fn close_channel(&self, rrcause: RrCause, cause: TermCause) -> MachineStatus {
        info!(chan = %self.chan.descriptive(), ?rrcause, %cause, "closing channel");
        self.l3sendm(L3Message::ChannelRelease { cause: rrcause });
        MachineStatus::QuitChannel(cause)
    }

    /// Log an input that is not handled in the current state. Tolerated.
    pub fn unexpected_state(&self, name: &'static str, state: DispatchKey) -> MachineStatus {
        info!(
            proc = name,
            state = format_args!("0x{:x}", state),
            tran = self.tran.id().0,
            "unexpected message or state, ignored"
        );
        MachineStatus::UnexpectedState
    }
}

/// Debug helper shared by the procedure implementations.
pub(crate) fn log_entry(name: &str, state: DispatchKey, input: &ProcInput<'_>) {
    debug!(proc = name, state = format_args!("0x{:x}", state), input = ?input, "run");
}
