//! The Activity State Machine: the heart of the core. Consumes decoded HCI
//! frames and platform notifications, mutates the connection table, arms
//! and disarms timers, and produces the normalized [`ActivityEvent`] stream.

use std::sync::Arc;

use crate::decode::{Command, Event};
use crate::error::Status;
use crate::event::{ActivityEvent, EventSink};
use crate::hci::common::{AclMode, BdAddr, ConnectionHandle, LinkType};
use crate::native::NativeEvent;
use crate::table::{AclOrSco, AclState, ConnectionTable, ScoState};
use crate::timer::{GenerationTimer, TimerSink};

/// Default `Page_Timeout`: 0x2000 slots * 5/8 ms/slot = 5120 ms.
pub const DEFAULT_PAGE_TIMEOUT_MS: u32 = 5120;

/// Which of the two timer slots a generation-tagged firing belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSlot {
    Page,
    PeriodicInquiry,
}

/// A function that re-enters the locked core to deliver a timer firing.
/// Supplied once by the owner (see `BtCoexCore::init`) so the state machine
/// can build timer callbacks without needing to know how re-entry is
/// implemented.
pub type TimerDispatch = Arc<dyn Fn(TimerSlot, u64) + Send + Sync>;

pub struct ActivityStateMachine {
    table: ConnectionTable,
    bt_on: bool,
    inquiry_active: bool,
    periodic_inquiry_mode: bool,
    paging: bool,
    connecting: bool,
    requesting: bool,
    page_timeout_ms: u32,
    periodic_inquiry_timeout_ms: u32,
    page_timer: GenerationTimer,
    periodic_inquiry_timer: GenerationTimer,
    timer_sink: Arc<dyn TimerSink>,
    dispatch: TimerDispatch,
    subscriber: Option<Box<dyn EventSink>>,
}

impl ActivityStateMachine {
    pub fn new(timer_sink: Arc<dyn TimerSink>, dispatch: TimerDispatch) -> Self {
        ActivityStateMachine {
            table: ConnectionTable::new(),
            bt_on: false,
            inquiry_active: false,
            periodic_inquiry_mode: false,
            paging: false,
            connecting: false,
            requesting: false,
            page_timeout_ms: DEFAULT_PAGE_TIMEOUT_MS,
            periodic_inquiry_timeout_ms: 0,
            page_timer: GenerationTimer::new(),
            periodic_inquiry_timer: GenerationTimer::new(),
            timer_sink,
            dispatch,
            subscriber: None,
        }
    }

    pub fn is_bt_on(&self) -> bool {
        self.bt_on
    }

    fn emit(&mut self, event: ActivityEvent) {
        if let Some(sink) = self.subscriber.as_mut() {
            sink.on_event(event);
        }
    }

    // ---- Timer plumbing -------------------------------------------------

    fn arm_page_timer(&mut self) {
        let dispatch = self.dispatch.clone();
        self.page_timer
            .arm(&*self.timer_sink, self.page_timeout_ms, move |tag| dispatch(TimerSlot::Page, tag));
    }

    fn arm_periodic_inquiry_timer(&mut self) {
        let dispatch = self.dispatch.clone();
        self.periodic_inquiry_timer.arm(
            &*self.timer_sink,
            self.periodic_inquiry_timeout_ms,
            move |tag| dispatch(TimerSlot::PeriodicInquiry, tag),
        );
    }

    fn close_paging(&mut self) {
        if self.paging {
            self.page_timer.disarm(&*self.timer_sink);
            self.emit(ActivityEvent::PageStopped);
            self.paging = false;
        }
    }

    /// Called by the owner after validating (via `GenerationTimer::is_current`
    /// through the owner's own bookkeeping, or directly here) that `tag` is
    /// still current for the page timer.
    pub fn on_page_timer_fire(&mut self, tag: u64) {
        if !self.page_timer.is_current(tag) {
            return;
        }
        // "Page expiry closes paging with timeout semantics: same observable
        // events as non-timeout close." The in-progress record (outgoing
        // connect or name request) is left in place so a retry of the same
        // command reactivates it instead of leaking a duplicate.
        self.close_paging();
        self.connecting = false;
        self.requesting = false;
    }

    pub fn on_periodic_inquiry_timer_fire(&mut self, tag: u64) {
        if !self.periodic_inquiry_timer.is_current(tag) {
            return;
        }
        if self.table.find_index_by_addr(BdAddr::ZERO).is_none() {
            if let Some(idx) = self.table.alloc(BdAddr::ZERO) {
                self.table.get_mut(idx).unwrap().acl_state = AclState::QueuedInquiry;
                self.enqueue_or_activate(idx);
            }
        }
        self.arm_periodic_inquiry_timer();
    }

    // ---- Queue activation -------------------------------------------------

    /// Enqueues `idx` behind whatever serial activity (paging or inquiry)
    /// currently holds the radio, or activates it immediately if none does.
    ///
    /// Established connections (`Connected`/`Streaming`) and in-flight
    /// incoming setups (`SettingUpIncoming`) sit at `queue_position == 0`
    /// permanently without ever being a serial activity, so the gate here
    /// must be "is a page or inquiry in progress", not "does some other
    /// record happen to be at queue position 0".
    fn enqueue_or_activate(&mut self, idx: usize) {
        let activity_in_progress = self.connecting || self.requesting || self.inquiry_active;
        if activity_in_progress {
            let qpos = self.table.next_qpos();
            self.table.get_mut(idx).unwrap().queue_position = qpos;
        } else {
            self.table.get_mut(idx).unwrap().queue_position = 0;
            self.activate(idx);
        }
    }

    fn activate(&mut self, idx: usize) {
        let (acl_state, addr) = match self.table.get(idx) {
            Some(r) => (r.acl_state, r.addr),
            None => return,
        };
        match acl_state {
            AclState::SettingUpOutgoing => {
                self.emit(ActivityEvent::CreateAclConnection(addr));
                self.arm_page_timer();
                self.paging = true;
                self.emit(ActivityEvent::PageStarted);
                self.connecting = true;
            }
            AclState::QueuedNameRequest => {
                self.arm_page_timer();
                self.paging = true;
                self.emit(ActivityEvent::PageStarted);
                self.requesting = true;
            }
            AclState::QueuedInquiry => {
                self.inquiry_active = true;
                self.emit(ActivityEvent::InquiryStarted);
            }
            _ => {}
        }
    }

    fn close_inquiry_activity(&mut self, idx: usize) {
        self.emit(ActivityEvent::InquiryStopped);
        self.inquiry_active = false;
        self.table.free(idx);
        if let Some(next) = self.table.dequeue() {
            self.activate(next);
        }
    }

    // ---- Power lifecycle --------------------------------------------------

    /// Performs the implicit power-on: assumes the transient state is
    /// already reset (true whenever `bt_on` was false, by invariant), flips
    /// `bt_on`, and emits `BtPowerOn`. The caller is responsible for pushing
    /// the cached WLAN-channels value afterward.
    pub fn power_on(&mut self) {
        self.bt_on = true;
        self.emit(ActivityEvent::BtPowerOn);
    }

    fn power_off(&mut self) {
        self.close_all_activity();
        self.bt_on = false;
        self.emit(ActivityEvent::BtPowerOff);
    }

    fn close_all_activity(&mut self) {
        if self.inquiry_active {
            self.emit(ActivityEvent::InquiryStopped);
            self.inquiry_active = false;
        }
        if self.periodic_inquiry_mode {
            self.periodic_inquiry_timer.disarm(&*self.timer_sink);
            self.periodic_inquiry_mode = false;
        }
        if self.paging {
            self.page_timer.disarm(&*self.timer_sink);
            self.emit(ActivityEvent::PageStopped);
            self.paging = false;
        }
        self.connecting = false;
        self.requesting = false;

        let indices: Vec<usize> = self.table.iter().map(|(i, _)| i).collect();
        for idx in indices {
            self.close_record(idx);
        }
        self.table.clear();
    }

    fn close_record(&mut self, idx: usize) {
        let snapshot = match self.table.get(idx) {
            Some(r) => r.clone(),
            None => return,
        };

        if snapshot.acl_state == AclState::Streaming {
            self.emit(ActivityEvent::A2DPStreamStop(snapshot.addr));
        }
        if matches!(
            snapshot.acl_state,
            AclState::SettingUpIncoming | AclState::SettingUpOutgoing
        ) {
            self.emit(ActivityEvent::AclConnectionComplete {
                addr: snapshot.addr,
                handle: ConnectionHandle::INVALID,
                success: false,
            });
        }
        if matches!(snapshot.acl_state, AclState::Connected | AclState::Streaming) {
            match snapshot.sco_state {
                ScoState::SettingUp => {
                    self.emit(ActivityEvent::SyncConnectionComplete {
                        addr: snapshot.addr,
                        handle: snapshot.sco_handle.unwrap_or(ConnectionHandle::INVALID),
                        success: false,
                        link_type: LinkType::Invalid,
                        sco_interval: 0,
                        sco_window: 0,
                        retrans_window: 0,
                    });
                }
                ScoState::Sco | ScoState::Esco => {
                    if let Some(h) = snapshot.sco_handle {
                        self.emit(ActivityEvent::DisconnectionComplete(h));
                    }
                }
                ScoState::None => {}
            }
            if let Some(h) = snapshot.acl_handle {
                self.emit(ActivityEvent::DisconnectionComplete(h));
            }
        }
    }

    // ---- Page timeout -------------------------------------------------

    fn apply_page_timeout_slots(&mut self, slots: u16) {
        if slots == 0 {
            log::warn!("rejecting HCI_Write_Page_Timeout/Read_Page_Timeout_Complete value of 0 slots");
            return;
        }
        self.page_timeout_ms = std::cmp::max(1, (slots as u32) * 5 / 8);
    }

    // ---- Command dispatch -------------------------------------------------

    pub fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Inquiry => {
                if self.inquiry_active || self.periodic_inquiry_mode {
                    log::debug!("dropping HCI_Inquiry: inquiry already active or in periodic mode");
                    return;
                }
                let Some(idx) = self.table.alloc(BdAddr::ZERO) else {
                    log::warn!("connection table full, dropping HCI_Inquiry");
                    return;
                };
                self.table.get_mut(idx).unwrap().acl_state = AclState::QueuedInquiry;
                self.enqueue_or_activate(idx);
            }
            Command::InquiryCancel => {
                if let Some(idx) = self.table.find_index_by_addr(BdAddr::ZERO) {
                    if self.table.get(idx).unwrap().queue_position == 0 {
                        self.close_inquiry_activity(idx);
                    } else {
                        self.table.remove_from_queue(idx);
                        self.table.free(idx);
                    }
                }
                if self.periodic_inquiry_mode {
                    // Workaround: the controller also silently ends ongoing
                    // inquiries on cancel even in periodic mode.
                    self.arm_periodic_inquiry_timer();
                }
            }
            Command::ExitPeriodicInquiry => {
                if self.periodic_inquiry_mode {
                    self.periodic_inquiry_timer.disarm(&*self.timer_sink);
                    self.periodic_inquiry_mode = false;
                }
            }
            Command::Reset => {
                self.close_all_activity();
                self.page_timeout_ms = DEFAULT_PAGE_TIMEOUT_MS;
            }
            Command::PeriodicInquiry {
                min_period_slots,
                inquiry_length_slots,
            } => {
                self.periodic_inquiry_timeout_ms =
                    (min_period_slots.saturating_sub(inquiry_length_slots)) as u32 * 1280;
                self.periodic_inquiry_mode = true;
                if self.table.find_index_by_addr(BdAddr::ZERO).is_none() {
                    if let Some(idx) = self.table.alloc(BdAddr::ZERO) {
                        self.table.get_mut(idx).unwrap().acl_state = AclState::QueuedInquiry;
                        self.enqueue_or_activate(idx);
                    }
                }
            }
            Command::CreateConnection { addr } => {
                let idx = match self.table.find_index_by_addr(addr) {
                    Some(existing) => existing,
                    None => match self.table.alloc(addr) {
                        Some(i) => i,
                        None => {
                            log::warn!("connection table full, dropping HCI_Create_Connection");
                            return;
                        }
                    },
                };
                self.table.get_mut(idx).unwrap().acl_state = AclState::SettingUpOutgoing;
                self.enqueue_or_activate(idx);
            }
            Command::AddScoConnection { acl_handle } => self.handle_setup_sync(acl_handle),
            Command::SetupSynchronousConnection { handle } => self.handle_setup_sync(handle),
            Command::RemoteNameRequest { addr } => {
                if let Some(idx) = self.table.find_index_by_addr(addr) {
                    let acl_state = self.table.get(idx).unwrap().acl_state;
                    if matches!(acl_state, AclState::Connected | AclState::Streaming) {
                        log::debug!("HCI_Remote_Name_Request for an already-connected peer: no paging needed");
                    }
                    return;
                }
                let Some(idx) = self.table.alloc(addr) else {
                    log::warn!("connection table full, dropping HCI_Remote_Name_Request");
                    return;
                };
                self.table.get_mut(idx).unwrap().acl_state = AclState::QueuedNameRequest;
                self.enqueue_or_activate(idx);
            }
            Command::WritePageTimeout { page_timeout_slots } => {
                self.apply_page_timeout_slots(page_timeout_slots);
            }
            Command::ReadPageTimeout => {}
            Command::Ignore => {}
        }
    }

    fn handle_setup_sync(&mut self, acl_handle: ConnectionHandle) {
        if let Some((idx, AclOrSco::Acl)) = self.table.find_index_by_handle(acl_handle) {
            let record = self.table.get_mut(idx).unwrap();
            if record.sco_state == ScoState::None {
                record.sco_state = ScoState::SettingUp;
                let addr = record.addr;
                self.emit(ActivityEvent::CreateSyncConnection(addr));
            }
        }
    }

    // ---- Event dispatch -------------------------------------------------

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::InquiryComplete => {
                if let Some(idx) = self.table.find_index_by_addr(BdAddr::ZERO) {
                    if self.table.get(idx).unwrap().queue_position == 0 {
                        self.close_inquiry_activity(idx);
                    }
                }
            }
            Event::ConnectionComplete {
                status,
                handle,
                addr,
                link_type,
            } => match link_type {
                LinkType::Acl => self.handle_connection_complete_acl(status, handle, addr),
                LinkType::Sco => self.handle_connection_complete_sco(status, handle, addr),
                LinkType::Esco | LinkType::Invalid => {}
            },
            Event::ConnectionRequest { addr, link_type } => match link_type {
                LinkType::Acl => {
                    if self.table.find_index_by_addr(addr).is_none() {
                        if let Some(idx) = self.table.alloc(addr) {
                            self.table.get_mut(idx).unwrap().acl_state = AclState::SettingUpIncoming;
                            self.emit(ActivityEvent::CreateAclConnection(addr));
                        } else {
                            log::warn!("connection table full, dropping inbound Connection_Request");
                        }
                    }
                }
                LinkType::Sco | LinkType::Esco => {
                    if let Some(idx) = self.table.find_index_by_addr(addr) {
                        let record = self.table.get_mut(idx).unwrap();
                        if matches!(record.acl_state, AclState::Connected | AclState::Streaming)
                            && record.sco_state == ScoState::None
                        {
                            record.sco_state = ScoState::SettingUp;
                            self.emit(ActivityEvent::CreateSyncConnection(addr));
                        }
                    }
                }
                LinkType::Invalid => {}
            },
            Event::DisconnectionComplete { handle } => self.handle_disconnection_complete(handle),
            Event::RemoteNameRequestComplete { addr } => {
                if let Some(idx) = self.table.find_index_by_addr(addr) {
                    let record = self.table.get(idx).unwrap();
                    if record.acl_state == AclState::QueuedNameRequest && record.queue_position == 0 {
                        self.close_paging();
                        self.requesting = false;
                        self.table.free(idx);
                        if let Some(next) = self.table.dequeue() {
                            self.activate(next);
                        }
                    }
                }
            }
            Event::ReadPageTimeoutComplete {
                status,
                page_timeout_slots,
            } => {
                if status == 0 {
                    self.apply_page_timeout_slots(page_timeout_slots);
                }
            }
            Event::RoleChange { status, addr } => {
                if status == 0 {
                    self.close_paging_if_outgoing(addr);
                }
            }
            Event::PinCodeRequest { addr } | Event::LinkKeyRequest { addr } => {
                self.close_paging_if_outgoing(addr);
            }
            Event::ModeChange { status, handle, mode } => {
                if status != 0 {
                    return;
                }
                if let Some((idx, AclOrSco::Acl)) = self.table.find_index_by_handle(handle) {
                    let record = self.table.get_mut(idx).unwrap();
                    if record.acl_mode != mode {
                        record.acl_mode = mode;
                        self.emit(ActivityEvent::ModeChanged(handle, mode));
                    }
                }
            }
            Event::SyncConnectionComplete {
                status,
                handle,
                addr,
                link_type,
                tx_interval,
                retrans_window,
            } => self.handle_sync_connection_complete(status, handle, addr, link_type, tx_interval, retrans_window),
            Event::SyncConnectionChanged {
                status,
                handle,
                tx_interval,
                retrans_window,
            } => {
                if status != 0 {
                    return;
                }
                if let Some((idx, AclOrSco::Sco)) = self.table.find_index_by_handle(handle) {
                    let record = self.table.get_mut(idx).unwrap();
                    record.sco_interval = tx_interval;
                    record.retrans_window = retrans_window;
                    record.sco_window = 2 + retrans_window;
                    let addr = record.addr;
                    self.emit(ActivityEvent::SyncConnectionUpdated {
                        addr,
                        handle,
                        sco_interval: tx_interval,
                        sco_window: 2 + retrans_window,
                        retrans_window,
                    });
                }
            }
            Event::Ignore => {}
        }
    }

    fn close_paging_if_outgoing(&mut self, addr: BdAddr) {
        if let Some(idx) = self.table.find_index_by_addr(addr) {
            if self.table.get(idx).unwrap().acl_state == AclState::SettingUpOutgoing {
                self.close_paging();
            }
        }
    }

    fn handle_connection_complete_acl(&mut self, status: u8, handle: ConnectionHandle, addr: BdAddr) {
        let Some(idx) = self.table.find_index_by_addr(addr) else {
            log::debug!("Connection_Complete for unknown address {:?}", addr);
            return;
        };
        let acl_state = self.table.get(idx).unwrap().acl_state;

        match acl_state {
            AclState::SettingUpIncoming => {
                if status == 0 {
                    let record = self.table.get_mut(idx).unwrap();
                    record.acl_state = AclState::Connected;
                    record.acl_handle = Some(handle);
                    record.acl_mode = AclMode::Active;
                    self.emit(ActivityEvent::AclConnectionComplete {
                        addr,
                        handle,
                        success: true,
                    });
                } else {
                    self.table.free(idx);
                    self.emit(ActivityEvent::AclConnectionComplete {
                        addr,
                        handle,
                        success: false,
                    });
                }
            }
            AclState::SettingUpOutgoing => {
                self.close_paging();
                self.connecting = false;
                if status == 0 {
                    let record = self.table.get_mut(idx).unwrap();
                    record.acl_state = AclState::Connected;
                    record.acl_handle = Some(handle);
                    record.acl_mode = AclMode::Active;
                    self.emit(ActivityEvent::AclConnectionComplete {
                        addr,
                        handle,
                        success: true,
                    });
                } else {
                    self.table.free(idx);
                    self.emit(ActivityEvent::AclConnectionComplete {
                        addr,
                        handle,
                        success: false,
                    });
                }
                if let Some(next) = self.table.dequeue() {
                    self.activate(next);
                }
            }
            _ => {
                log::debug!("Connection_Complete (ACL) for {:?} in unexpected state {:?}", addr, acl_state);
            }
        }
    }

    fn handle_connection_complete_sco(&mut self, status: u8, handle: ConnectionHandle, addr: BdAddr) {
        let Some(idx) = self.table.find_index_by_addr(addr) else {
            return;
        };
        if self.table.get(idx).unwrap().sco_state != ScoState::SettingUp {
            return;
        }
        if status == 0 {
            let record = self.table.get_mut(idx).unwrap();
            record.sco_state = ScoState::Sco;
            record.sco_handle = Some(handle);
            record.sco_interval = 6;
            record.sco_window = 2;
            record.retrans_window = 0;
            self.emit(ActivityEvent::SyncConnectionComplete {
                addr,
                handle,
                success: true,
                link_type: LinkType::Sco,
                sco_interval: 6,
                sco_window: 2,
                retrans_window: 0,
            });
        } else {
            self.table.get_mut(idx).unwrap().sco_state = ScoState::None;
            self.emit(ActivityEvent::SyncConnectionComplete {
                addr,
                handle,
                success: false,
                link_type: LinkType::Sco,
                sco_interval: 0,
                sco_window: 0,
                retrans_window: 0,
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_sync_connection_complete(
        &mut self,
        status: u8,
        handle: ConnectionHandle,
        addr: BdAddr,
        link_type: LinkType,
        tx_interval: u8,
        retrans_window: u8,
    ) {
        let Some(idx) = self.table.find_index_by_addr(addr) else {
            return;
        };
        if self.table.get(idx).unwrap().sco_state != ScoState::SettingUp {
            return;
        }

        if status != 0 {
            self.table.get_mut(idx).unwrap().sco_state = ScoState::None;
            self.emit(ActivityEvent::SyncConnectionComplete {
                addr,
                handle,
                success: false,
                link_type,
                sco_interval: 0,
                sco_window: 0,
                retrans_window: 0,
            });
            return;
        }

        let (new_state, sco_interval) = match link_type {
            LinkType::Sco => (ScoState::Sco, 6),
            _ => (ScoState::Esco, tx_interval),
        };
        let sco_window = 2 + retrans_window;

        let record = self.table.get_mut(idx).unwrap();
        record.sco_state = new_state;
        record.sco_handle = Some(handle);
        record.sco_interval = sco_interval;
        record.retrans_window = retrans_window;
        record.sco_window = sco_window;

        self.emit(ActivityEvent::SyncConnectionComplete {
            addr,
            handle,
            success: true,
            link_type,
            sco_interval,
            sco_window,
            retrans_window,
        });
    }

    fn handle_disconnection_complete(&mut self, handle: ConnectionHandle) {
        match self.table.find_index_by_handle(handle) {
            Some((idx, AclOrSco::Sco)) => {
                let record = self.table.get_mut(idx).unwrap();
                record.sco_state = ScoState::None;
                record.sco_handle = None;
                self.emit(ActivityEvent::DisconnectionComplete(handle));
            }
            Some((idx, AclOrSco::Acl)) => {
                let snapshot = self.table.get(idx).unwrap().clone();
                if snapshot.acl_state == AclState::Streaming {
                    self.emit(ActivityEvent::A2DPStreamStop(snapshot.addr));
                }
                match snapshot.sco_state {
                    ScoState::SettingUp => {
                        self.emit(ActivityEvent::SyncConnectionComplete {
                            addr: snapshot.addr,
                            handle: snapshot.sco_handle.unwrap_or(ConnectionHandle::INVALID),
                            success: false,
                            link_type: LinkType::Invalid,
                            sco_interval: 0,
                            sco_window: 0,
                            retrans_window: 0,
                        });
                    }
                    ScoState::Sco | ScoState::Esco => {
                        if let Some(h) = snapshot.sco_handle {
                            self.emit(ActivityEvent::DisconnectionComplete(h));
                        }
                    }
                    ScoState::None => {}
                }
                self.emit(ActivityEvent::DisconnectionComplete(handle));
                self.table.free(idx);
            }
            None => {
                log::debug!("Disconnection_Complete for unknown handle {:?}", handle);
            }
        }
    }

    // ---- Native events -------------------------------------------------

    pub fn handle_native(&mut self, event: NativeEvent) {
        match event {
            NativeEvent::DeviceSwitchedOn => {}
            NativeEvent::DeviceSwitchedOff => {
                if self.bt_on {
                    self.power_off();
                }
            }
            NativeEvent::A2DPStreamStart(addr) => {
                if let Some(idx) = self.table.find_index_by_addr(addr) {
                    let record = self.table.get_mut(idx).unwrap();
                    if record.acl_state == AclState::Connected {
                        record.acl_state = AclState::Streaming;
                        self.emit(ActivityEvent::A2DPStreamStart(addr));
                    }
                }
            }
            NativeEvent::A2DPStreamStop(addr) => {
                if let Some(idx) = self.table.find_index_by_addr(addr) {
                    let record = self.table.get_mut(idx).unwrap();
                    if record.acl_state == AclState::Streaming {
                        record.acl_state = AclState::Connected;
                        self.emit(ActivityEvent::A2DPStreamStop(addr));
                    }
                }
            }
        }
    }

    // ---- Registration & state report -------------------------------------------------

    pub fn register(&mut self, sink: Box<dyn EventSink>) -> Result<(), Status> {
        if self.subscriber.is_some() {
            return Err(Status::AlreadyRegistered);
        }
        self.subscriber = Some(sink);
        self.replay_snapshot();
        Ok(())
    }

    pub fn deregister(&mut self) -> Result<Box<dyn EventSink>, Status> {
        self.subscriber.take().ok_or(Status::NotRegistered)
    }

    pub fn state_report(&mut self) -> Result<(), Status> {
        if self.subscriber.is_none() {
            return Err(Status::NotRegistered);
        }
        self.replay_snapshot();
        Ok(())
    }

    fn replay_snapshot(&mut self) {
        if !self.bt_on {
            self.emit(ActivityEvent::BtPowerOff);
            return;
        }
        self.emit(ActivityEvent::BtPowerOn);
        if self.inquiry_active {
            self.emit(ActivityEvent::InquiryStarted);
        }
        if self.paging {
            self.emit(ActivityEvent::PageStarted);
        }

        let active_records: Vec<usize> = self
            .table
            .iter()
            .filter(|(_, r)| r.queue_position == 0)
            .map(|(i, _)| i)
            .collect();
        for idx in active_records {
            self.replay_record(idx);
        }
    }

    fn replay_record(&mut self, idx: usize) {
        let snapshot = match self.table.get(idx) {
            Some(r) => r.clone(),
            None => return,
        };

        match snapshot.acl_state {
            AclState::QueuedInquiry | AclState::QueuedNameRequest | AclState::Invalid => {}
            AclState::SettingUpIncoming | AclState::SettingUpOutgoing => {
                self.emit(ActivityEvent::CreateAclConnection(snapshot.addr));
            }
            AclState::Connected | AclState::Streaming => {
                let handle = snapshot.acl_handle.unwrap_or(ConnectionHandle::INVALID);
                self.emit(ActivityEvent::CreateAclConnection(snapshot.addr));
                self.emit(ActivityEvent::AclConnectionComplete {
                    addr: snapshot.addr,
                    handle,
                    success: true,
                });
                if snapshot.acl_mode != AclMode::Active {
                    self.emit(ActivityEvent::ModeChanged(handle, snapshot.acl_mode));
                }
                if snapshot.acl_state == AclState::Streaming {
                    self.emit(ActivityEvent::A2DPStreamStart(snapshot.addr));
                }
                match snapshot.sco_state {
                    ScoState::SettingUp => {
                        self.emit(ActivityEvent::CreateSyncConnection(snapshot.addr));
                    }
                    ScoState::Sco | ScoState::Esco => {
                        let sco_handle = snapshot.sco_handle.unwrap_or(ConnectionHandle::INVALID);
                        let link_type = if snapshot.sco_state == ScoState::Sco {
                            LinkType::Sco
                        } else {
                            LinkType::Esco
                        };
                        self.emit(ActivityEvent::CreateSyncConnection(snapshot.addr));
                        self.emit(ActivityEvent::SyncConnectionComplete {
                            addr: snapshot.addr,
                            handle: sco_handle,
                            success: true,
                            link_type,
                            sco_interval: snapshot.sco_interval,
                            sco_window: snapshot.sco_window,
                            retrans_window: snapshot.retrans_window,
                        });
                    }
                    ScoState::None => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod scenarios {
    use super::*;
    use crate::decode::{decode_command, decode_event};
    use crate::timer::TimerHandle;
    use std::sync::Mutex;

    struct NullTimerSink;
    impl TimerSink for NullTimerSink {
        fn start(&self, _timeout_ms: u32, _callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
            TimerHandle::default()
        }
        fn stop(&self, _handle: TimerHandle) {}
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ActivityEvent>>,
    }

    impl EventSink for Arc<RecordingSink> {
        fn on_event(&mut self, event: ActivityEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn new_machine() -> (ActivityStateMachine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let timer_sink: Arc<dyn TimerSink> = Arc::new(NullTimerSink);
        let dispatch: TimerDispatch = Arc::new(|_, _| {});
        let mut sm = ActivityStateMachine::new(timer_sink, dispatch);
        sm.register(Box::new(sink.clone())).unwrap();
        sink.events.lock().unwrap().clear(); // drop the initial BtPowerOff snapshot
        (sm, sink)
    }

    fn power_on(sm: &mut ActivityStateMachine) {
        sm.power_on();
    }

    fn drain(sink: &RecordingSink) -> Vec<ActivityEvent> {
        sink.events.lock().unwrap().drain(..).collect()
    }

    #[test]
    fn s1_bring_up_inquiry_teardown() {
        let (mut sm, sink) = new_machine();

        power_on(&mut sm);
        let cmd = decode_command(&[0x01, 0x04, 0x05, 0x33, 0x8B, 0x9E, 0x08, 0x00]);
        sm.handle_command(cmd);
        let evt = decode_event(&[0x01, 0x01, 0x00]);
        sm.handle_event(evt);
        sm.handle_native(NativeEvent::DeviceSwitchedOff);

        assert_eq!(
            drain(&sink),
            vec![
                ActivityEvent::BtPowerOn,
                ActivityEvent::InquiryStarted,
                ActivityEvent::InquiryStopped,
                ActivityEvent::BtPowerOff,
            ]
        );
    }

    #[test]
    fn s3_inbound_acl_then_a2dp_stream() {
        let (mut sm, sink) = new_machine();
        power_on(&mut sm);

        let conn_req = decode_event(&[0x04, 0x0A, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x40, 0x04, 0x08, 0x01]);
        sm.handle_event(conn_req);

        let conn_complete = decode_event(&[
            0x03, 0x0B, 0x00, 0x2B, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x01, 0x00, 0x00, 0x00,
        ]);
        sm.handle_event(conn_complete);

        let addr = BdAddr::from_wire_bytes([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        sm.handle_native(NativeEvent::A2DPStreamStart(addr));

        assert_eq!(
            drain(&sink),
            vec![
                ActivityEvent::BtPowerOn,
                ActivityEvent::CreateAclConnection(addr),
                ActivityEvent::AclConnectionComplete {
                    addr,
                    handle: ConnectionHandle::from_wire(0x002B),
                    success: true,
                },
                ActivityEvent::A2DPStreamStart(addr),
            ]
        );
    }

    #[test]
    fn second_create_connection_activates_after_an_established_acl_is_already_up() {
        // Regression test: an established connection (or an in-flight
        // incoming setup) sits at queue_position == 0 forever without being
        // a serial activity. A later Create_Connection/Inquiry/Remote_Name_
        // Request must still activate immediately, not get wedged behind it.
        let (mut sm, sink) = new_machine();
        power_on(&mut sm);

        // X connects inbound and completes successfully; it now occupies a
        // permanent queue_position == 0 slot without ever setting
        // `connecting`/`requesting`/`inquiry_active`.
        let conn_req = decode_event(&[0x04, 0x0A, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x40, 0x04, 0x08, 0x01]);
        sm.handle_event(conn_req);
        let conn_complete = decode_event(&[
            0x03, 0x0B, 0x00, 0x2B, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x01, 0x00, 0x00, 0x00,
        ]);
        sm.handle_event(conn_complete);
        drain(&sink);

        // Y is a distinct address; Create_Connection must page for it right
        // away instead of sitting queued behind X forever.
        let create_y = decode_command(&[
            0x05, 0x04, 0x0D, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x18, 0xCC, 0x02, 0x00, 0x00, 0x00,
            0x01,
        ]);
        sm.handle_command(create_y);

        let addr_y = BdAddr::from_wire_bytes([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        assert_eq!(
            drain(&sink),
            vec![
                ActivityEvent::CreateAclConnection(addr_y),
                ActivityEvent::PageStarted,
            ]
        );
    }

    #[test]
    fn second_inquiry_activates_after_an_established_acl_is_already_up() {
        let (mut sm, sink) = new_machine();
        power_on(&mut sm);

        let conn_req = decode_event(&[0x04, 0x0A, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x40, 0x04, 0x08, 0x01]);
        sm.handle_event(conn_req);
        let conn_complete = decode_event(&[
            0x03, 0x0B, 0x00, 0x2B, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x01, 0x00, 0x00, 0x00,
        ]);
        sm.handle_event(conn_complete);
        drain(&sink);

        let inquiry = decode_command(&[0x01, 0x04, 0x05, 0x33, 0x8B, 0x9E, 0x08, 0x00]);
        sm.handle_command(inquiry);

        assert_eq!(drain(&sink), vec![ActivityEvent::InquiryStarted]);
    }

    #[test]
    fn s5_hci_reset_disconnects_established_acl_without_power_off() {
        let (mut sm, sink) = new_machine();
        power_on(&mut sm);
        drain(&sink);

        // Establish an inbound ACL connection at handle 0x0030.
        let addr = BdAddr::from_wire_bytes([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        if let Some(idx) = sm.table.alloc(addr) {
            let record = sm.table.get_mut(idx).unwrap();
            record.acl_state = AclState::Connected;
            record.acl_handle = Some(ConnectionHandle::from_wire(0x0030));
        }

        let reset = decode_command(&[0x03, 0x0C, 0x00]);
        sm.handle_command(reset);

        assert_eq!(
            drain(&sink),
            vec![ActivityEvent::DisconnectionComplete(ConnectionHandle::from_wire(0x0030))]
        );
        assert!(sm.is_bt_on());
    }

    #[test]
    fn s6_sync_connection_setup_and_update() {
        let (mut sm, sink) = new_machine();
        power_on(&mut sm);
        drain(&sink);

        let addr = BdAddr::from_wire_bytes([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        if let Some(idx) = sm.table.alloc(addr) {
            let record = sm.table.get_mut(idx).unwrap();
            record.acl_state = AclState::Connected;
            record.acl_handle = Some(ConnectionHandle::from_wire(0x0030));
        }

        let setup = decode_command(&[
            0x28, 0x04, 0x11, 0x30, 0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00,
            0xFF, 0xFF, 0x03, 0x02, 0xCC,
        ]);
        sm.handle_command(setup);

        let complete_params = [
            0x00, 0x31, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x02, 0x06, 0x02, 0x07, 0x00, 0x00,
            0x00, 0x02,
        ];
        let mut complete_bytes = vec![0x2C, complete_params.len() as u8];
        complete_bytes.extend_from_slice(&complete_params);
        sm.handle_event(decode_event(&complete_bytes));

        let changed_params = [0x00, 0x31, 0x00, 0x08, 0x02, 0x00, 0x00, 0x00, 0x02];
        let mut changed_bytes = vec![0x2D, changed_params.len() as u8];
        changed_bytes.extend_from_slice(&changed_params);
        sm.handle_event(decode_event(&changed_bytes));

        assert_eq!(
            drain(&sink),
            vec![
                ActivityEvent::CreateSyncConnection(addr),
                ActivityEvent::SyncConnectionComplete {
                    addr,
                    handle: ConnectionHandle::from_wire(0x0031),
                    success: true,
                    link_type: LinkType::Esco,
                    sco_interval: 6,
                    sco_window: 4,
                    retrans_window: 2,
                },
                ActivityEvent::SyncConnectionUpdated {
                    addr,
                    handle: ConnectionHandle::from_wire(0x0031),
                    sco_interval: 8,
                    sco_window: 4,
                    retrans_window: 2,
                },
            ]
        );
    }
}
