//! in-memory [`KmsDevice`] for driving the pipeline without hardware
//!
//! completion events are signalled through a socketpair so the real event
//! loop can wait on the fake's descriptor
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    io::{self, Read, Write},
    os::{
        fd::{AsFd, BorrowedFd},
        unix::net::UnixStream,
    },
    rc::Rc,
    time::Duration,
};

use kms_device::{
    AtomicProperty, BlobId, ClientCapability, CommitFlags, ConnectionState, ConnectorId,
    ConnectorInfo, CrtcId, DriverCapability, DumbBuffer, EncoderId, EncoderInfo, FlipEvent,
    FramebufferId, KmsDevice, ModeInfo, ModeTimings, Object, PlaneId, PlaneInfo, PropertyId,
    PropertyInfo, Resources, PLANE_TYPE_PRIMARY,
};

const PLANE_PROPERTIES: [&str; 10] = [
    "FB_ID", "CRTC_ID", "SRC_X", "SRC_Y", "SRC_W", "SRC_H", "CRTC_X", "CRTC_Y", "CRTC_W", "CRTC_H",
];

pub fn mode(width: u16, height: u16) -> ModeInfo {
    ModeInfo {
        name: format!("{width}x{height}"),
        width,
        height,
        vrefresh: 60,
        preferred: false,
        timings: ModeTimings {
            clock: u32::from(width) * u32::from(height) * 60 / 1000,
            htotal: width,
            vtotal: height,
            ..ModeTimings::default()
        },
    }
}

/// one-shot failure of the next matching call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    CreateDumb,
    AddFramebuffer,
    Map,
    ModeBlob,
    PlaneIds,
    ReadEvents,
}

/// an atomic commit as the device saw it
#[derive(Debug, Clone)]
pub struct Commit {
    pub flags: CommitFlags,
    pub properties: Vec<(Object, String, u64)>,
    pub accepted: bool,
}

impl Commit {
    pub fn value(&self, object: Object, name: &str) -> Option<u64> {
        self.properties
            .iter()
            .find(|(o, n, _)| *o == object && n == name)
            .map(|(_, _, value)| *value)
    }

    /// value of the first property called `name`, whatever object it is on
    pub fn value_named(&self, name: &str) -> Option<u64> {
        self.properties
            .iter()
            .find(|(_, n, _)| n == name)
            .map(|(_, _, value)| *value)
    }
}

#[derive(Default)]
struct Inner {
    next_id: u32,
    property_ids: HashMap<String, PropertyId>,
    objects: HashMap<Object, Vec<(PropertyId, u64)>>,
    res: Resources,
    planes: Vec<PlaneInfo>,
    encoders: HashMap<EncoderId, EncoderInfo>,
    connectors: HashMap<ConnectorId, ConnectorInfo>,

    client_caps: Vec<ClientCapability>,
    missing_driver_caps: Vec<DriverCapability>,

    failures: Vec<Failure>,
    dumb_failure_at: Option<usize>,
    dumbs_created: usize,
    reject_validation: bool,
    rejected_applies: HashSet<usize>,
    applies: usize,
    commits: Vec<Commit>,

    dumbs: HashSet<u32>,
    /// framebuffer -> dumb buffer handle
    framebuffers: HashMap<u32, u32>,
    blobs: HashMap<u32, ModeInfo>,

    /// framebuffers referenced by commits whose event is not delivered yet
    in_flight: HashMap<CrtcId, Vec<u32>>,
    events: VecDeque<FlipEvent>,
    held: HashSet<CrtcId>,
    one_per_read: bool,
    sequence: u32,
    signalled: bool,

    violations: Vec<String>,
}

impl Inner {
    fn id(&mut self) -> u32 {
        if self.next_id == 0 {
            self.next_id = 30;
        }
        self.next_id += 1;
        self.next_id
    }

    fn attach(&mut self, object: Object, props: &[(&str, u64)]) {
        let mut list = Vec::with_capacity(props.len());
        for (name, value) in props {
            let id = match self.property_ids.get(*name) {
                Some(id) => *id,
                None => {
                    let id = PropertyId(self.id());
                    self.property_ids.insert(name.to_string(), id);
                    id
                }
            };
            list.push((id, *value));
        }
        self.objects.insert(object, list);
    }

    fn property_name(&self, id: PropertyId) -> Option<String> {
        self.property_ids
            .iter()
            .find_map(|(name, prop)| (*prop == id).then(|| name.clone()))
    }

    fn take_failure(&mut self, failure: Failure) -> bool {
        match self.failures.iter().position(|f| *f == failure) {
            Some(index) => {
                self.failures.remove(index);
                true
            }
            None => false,
        }
    }

    fn has_deliverable(&self) -> bool {
        self.events.iter().any(|event| !self.held.contains(&event.crtc))
    }

    fn violation(&mut self, msg: String) {
        self.violations.push(msg);
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[derive(Clone)]
pub struct FakeDevice {
    inner: Rc<RefCell<Inner>>,
    events_rx: Rc<UnixStream>,
    events_tx: Rc<UnixStream>,
}

impl FakeDevice {
    pub fn new() -> Self {
        let (rx, tx) = UnixStream::pair().expect("socketpair");
        rx.set_nonblocking(true).expect("nonblocking socket");
        Self {
            inner: Rc::default(),
            events_rx: Rc::new(rx),
            events_tx: Rc::new(tx),
        }
    }

    /// one connected connector per entry, each with its own crtc, encoder and primary plane
    pub fn with_outputs(sizes: &[(u16, u16)]) -> Self {
        let mut device = Self::new();
        for (index, (width, height)) in sizes.iter().enumerate() {
            let crtc = device.add_crtc();
            let mask = 1 << index;
            device.add_plane(mask, PLANE_TYPE_PRIMARY);
            let encoder = device.add_encoder(mask, Some(crtc));
            let mut mode = mode(*width, *height);
            mode.preferred = true;
            device.add_connector(
                &format!("DP-{}", index + 1),
                ConnectionState::Connected,
                vec![mode],
                vec![encoder],
                Some(encoder),
            );
        }
        device
    }

    pub fn add_crtc(&mut self) -> CrtcId {
        let mut inner = self.inner.borrow_mut();
        let crtc = CrtcId(inner.id());
        inner.res.crtcs.push(crtc);
        inner.attach(Object::Crtc(crtc), &[("ACTIVE", 0), ("MODE_ID", 0)]);
        crtc
    }

    pub fn add_plane(&mut self, possible_crtcs: u32, kind: u64) -> PlaneId {
        let mut inner = self.inner.borrow_mut();
        let id = PlaneId(inner.id());
        inner.planes.push(PlaneInfo { id, possible_crtcs });
        let mut props = vec![("type", kind)];
        props.extend(PLANE_PROPERTIES.iter().map(|name| (*name, 0)));
        inner.attach(Object::Plane(id), &props);
        id
    }

    pub fn add_encoder(&mut self, possible_crtcs: u32, crtc: Option<CrtcId>) -> EncoderId {
        let mut inner = self.inner.borrow_mut();
        let id = EncoderId(inner.id());
        inner.res.encoders.push(id);
        inner.encoders.insert(id, EncoderInfo { id, crtc, possible_crtcs });
        id
    }

    pub fn add_connector(
        &mut self,
        name: &str,
        state: ConnectionState,
        modes: Vec<ModeInfo>,
        encoders: Vec<EncoderId>,
        current_encoder: Option<EncoderId>,
    ) -> ConnectorId {
        let mut inner = self.inner.borrow_mut();
        let id = ConnectorId(inner.id());
        inner.res.connectors.push(id);
        inner.connectors.insert(
            id,
            ConnectorInfo {
                id,
                name: name.to_owned(),
                state,
                modes,
                encoders,
                current_encoder,
            },
        );
        inner.attach(Object::Connector(id), &[("CRTC_ID", 0), ("DPMS", 0)]);
        id
    }

    pub fn remove_property(&self, object: Object, name: &str) {
        let mut inner = self.inner.borrow_mut();
        let Some(id) = inner.property_ids.get(name).copied() else {
            return;
        };
        if let Some(props) = inner.objects.get_mut(&object) {
            props.retain(|(prop, _)| *prop != id);
        }
    }

    pub fn property_name(&self, id: PropertyId) -> Option<String> {
        self.inner.borrow().property_name(id)
    }

    pub fn without_driver_capability(&self, cap: DriverCapability) {
        self.inner.borrow_mut().missing_driver_caps.push(cap);
    }

    pub fn client_capabilities(&self) -> Vec<ClientCapability> {
        self.inner.borrow().client_caps.clone()
    }

    pub fn fail_next(&self, failure: Failure) {
        self.inner.borrow_mut().failures.push(failure);
    }

    /// the `n`th dumb buffer allocation, counting from 1, fails
    pub fn fail_nth_dumb_buffer(&self, n: usize) {
        let mut inner = self.inner.borrow_mut();
        inner.dumb_failure_at = Some(inner.dumbs_created + n);
    }

    pub fn reject_validation(&self) {
        self.inner.borrow_mut().reject_validation = true;
    }

    /// reject the `n`th non test-only commit, counting from 1
    pub fn reject_commit(&self, n: usize) {
        self.inner.borrow_mut().rejected_applies.insert(n);
    }

    /// keep completion events of `crtc` queued
    pub fn hold_events(&self, crtc: CrtcId) {
        self.inner.borrow_mut().held.insert(crtc);
    }

    pub fn deliver_one_event_per_read(&self, enable: bool) {
        self.inner.borrow_mut().one_per_read = enable;
    }

    /// queue a completion event no commit asked for
    pub fn inject_event(&self, crtc: CrtcId) {
        let mut inner = self.inner.borrow_mut();
        inner.sequence += 1;
        let frame = inner.sequence;
        inner.events.push_back(FlipEvent {
            crtc,
            frame,
            time: Duration::ZERO,
        });
        self.signal(&mut inner);
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.inner.borrow().commits.clone()
    }

    /// non test-only commits attempted so far
    pub fn apply_commits(&self) -> usize {
        self.inner.borrow().applies
    }

    pub fn pending_events(&self) -> usize {
        self.inner.borrow().events.len()
    }

    pub fn live_dumb_buffers(&self) -> usize {
        self.inner.borrow().dumbs.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.inner.borrow().framebuffers.len()
    }

    pub fn live_blobs(&self) -> usize {
        self.inner.borrow().blobs.len()
    }

    /// the mode a live blob was created from
    pub fn blob_mode(&self, blob: u64) -> Option<ModeInfo> {
        let id = u32::try_from(blob).ok()?;
        self.inner.borrow().blobs.get(&id).cloned()
    }

    /// misuse the kernel would punish: freeing in-flight framebuffers,
    /// double frees, committing on a crtc with a flip outstanding
    pub fn violations(&self) -> Vec<String> {
        self.inner.borrow().violations.clone()
    }

    fn signal(&self, inner: &mut Inner) {
        if inner.signalled || !inner.has_deliverable() {
            return;
        }
        (&*self.events_tx).write_all(&[1]).expect("signal event");
        inner.signalled = true;
    }

    fn drain_signal(&self) {
        let mut buf = [0u8; 16];
        loop {
            match (&*self.events_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

impl AsFd for FakeDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.events_rx.as_fd()
    }
}

impl KmsDevice for FakeDevice {
    type Mapping = Box<[u8]>;

    fn set_client_capability(&self, cap: ClientCapability, _enable: bool) -> io::Result<()> {
        self.inner.borrow_mut().client_caps.push(cap);
        Ok(())
    }

    fn driver_capability(&self, cap: DriverCapability) -> io::Result<u64> {
        let missing = self.inner.borrow().missing_driver_caps.contains(&cap);
        Ok(u64::from(!missing))
    }

    fn resources(&self) -> io::Result<Resources> {
        Ok(self.inner.borrow().res.clone())
    }

    fn plane_ids(&self) -> io::Result<Vec<PlaneId>> {
        let mut inner = self.inner.borrow_mut();
        if inner.take_failure(Failure::PlaneIds) {
            return Err(errno(libc::EIO));
        }
        Ok(inner.planes.iter().map(|plane| plane.id).collect())
    }

    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo> {
        self.inner
            .borrow()
            .connectors
            .get(&id)
            .cloned()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo> {
        self.inner
            .borrow()
            .encoders
            .get(&id)
            .copied()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn plane(&self, id: PlaneId) -> io::Result<PlaneInfo> {
        self.inner
            .borrow()
            .planes
            .iter()
            .find(|plane| plane.id == id)
            .copied()
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn properties(&self, object: Object) -> io::Result<Vec<PropertyInfo>> {
        let inner = self.inner.borrow();
        let Some(props) = inner.objects.get(&object) else {
            return Ok(Vec::new());
        };
        Ok(props
            .iter()
            .filter_map(|(id, value)| {
                Some(PropertyInfo {
                    id: *id,
                    name: inner.property_name(*id)?,
                    value: *value,
                })
            })
            .collect())
    }

    fn create_mode_blob(&self, mode: &ModeInfo) -> io::Result<BlobId> {
        let mut inner = self.inner.borrow_mut();
        if inner.take_failure(Failure::ModeBlob) {
            return Err(errno(libc::ENOMEM));
        }
        let id = inner.id();
        inner.blobs.insert(id, mode.clone());
        Ok(BlobId(id))
    }

    fn destroy_blob(&self, blob: BlobId) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.blobs.remove(&blob.0).is_none() {
            inner.violation(format!("blob {blob} destroyed twice"));
            return Err(errno(libc::ENOENT));
        }
        Ok(())
    }

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbBuffer> {
        let mut inner = self.inner.borrow_mut();
        inner.dumbs_created += 1;
        let injected = inner.dumb_failure_at == Some(inner.dumbs_created);
        if injected || inner.take_failure(Failure::CreateDumb) {
            return Err(errno(libc::ENOMEM));
        }
        let handle = inner.id();
        inner.dumbs.insert(handle);
        let pitch = width * bpp.div_ceil(8);
        Ok(DumbBuffer {
            handle,
            width,
            height,
            bpp,
            pitch,
            size: u64::from(pitch) * u64::from(height),
        })
    }

    fn add_framebuffer(&self, buffer: &DumbBuffer, _depth: u32) -> io::Result<FramebufferId> {
        let mut inner = self.inner.borrow_mut();
        if inner.take_failure(Failure::AddFramebuffer) || !inner.dumbs.contains(&buffer.handle) {
            return Err(errno(libc::EINVAL));
        }
        let fb = inner.id();
        inner.framebuffers.insert(fb, buffer.handle);
        Ok(FramebufferId(fb))
    }

    fn map_dumb_buffer(&self, buffer: &DumbBuffer) -> io::Result<Self::Mapping> {
        let mut inner = self.inner.borrow_mut();
        if inner.take_failure(Failure::Map) || !inner.dumbs.contains(&buffer.handle) {
            return Err(errno(libc::EINVAL));
        }
        // garbage, so that missing zero-fill shows
        Ok(vec![0x5a; buffer.size as usize].into_boxed_slice())
    }

    fn destroy_framebuffer(&self, fb: FramebufferId) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.in_flight.values().any(|fbs| fbs.contains(&fb.0)) {
            inner.violation(format!("framebuffer {fb} destroyed while a flip to it is pending"));
        }
        if inner.framebuffers.remove(&fb.0).is_none() {
            inner.violation(format!("framebuffer {fb} destroyed twice"));
            return Err(errno(libc::ENOENT));
        }
        Ok(())
    }

    fn destroy_dumb_buffer(&self, buffer: DumbBuffer) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.framebuffers.values().any(|handle| *handle == buffer.handle) {
            let msg = format!("dumb buffer {} destroyed under its framebuffer", buffer.handle);
            inner.violation(msg);
        }
        if !inner.dumbs.remove(&buffer.handle) {
            inner.violation(format!("dumb buffer {} destroyed twice", buffer.handle));
            return Err(errno(libc::ENOENT));
        }
        Ok(())
    }

    fn atomic_commit(&self, flags: CommitFlags, properties: &[AtomicProperty]) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();

        let mut commit = Commit {
            flags,
            properties: Vec::with_capacity(properties.len()),
            accepted: false,
        };
        let mut known = true;
        for (object, prop, value) in properties {
            let attached = inner
                .objects
                .get(object)
                .is_some_and(|props| props.iter().any(|(id, _)| id == prop));
            known &= attached;
            let name = inner.property_name(*prop).unwrap_or_default();
            commit.properties.push((*object, name, *value));
        }

        let test_only = flags.contains(CommitFlags::TEST_ONLY);
        if !test_only {
            inner.applies += 1;
        }

        let crtcs: Vec<CrtcId> = commit
            .properties
            .iter()
            .filter_map(|(object, _, _)| match object {
                Object::Crtc(crtc) => Some(*crtc),
                _ => None,
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let framebuffers: Vec<u32> = commit
            .properties
            .iter()
            .filter(|(_, name, _)| name == "FB_ID")
            .filter_map(|(_, _, value)| u32::try_from(*value).ok())
            .collect();

        let registered = framebuffers
            .iter()
            .all(|fb| inner.framebuffers.contains_key(fb));
        let result = if !known || !registered {
            Err(errno(libc::EINVAL))
        } else if test_only {
            match inner.reject_validation {
                true => Err(errno(libc::EINVAL)),
                false => Ok(()),
            }
        } else if inner.rejected_applies.contains(&inner.applies) {
            Err(errno(libc::EINVAL))
        } else if let Some(busy) = crtcs.iter().find(|crtc| inner.in_flight.contains_key(crtc)) {
            let msg = format!("commit on crtc {busy} while a flip is pending");
            inner.violation(msg);
            Err(errno(libc::EBUSY))
        } else {
            Ok(())
        };

        commit.accepted = result.is_ok();
        inner.commits.push(commit);

        if result.is_ok() && !test_only && flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
            for crtc in crtcs {
                inner.in_flight.insert(crtc, framebuffers.clone());
                inner.sequence += 1;
                let frame = inner.sequence;
                inner.events.push_back(FlipEvent {
                    crtc,
                    frame,
                    time: Duration::from_micros(16_667 * u64::from(frame)),
                });
            }
            self.signal(&mut inner);
        }

        result
    }

    fn flip_events(&self) -> io::Result<Vec<FlipEvent>> {
        let mut inner = self.inner.borrow_mut();
        if inner.take_failure(Failure::ReadEvents) {
            return Err(errno(libc::EIO));
        }
        self.drain_signal();
        inner.signalled = false;

        let mut delivered = Vec::new();
        let mut kept = VecDeque::new();
        while let Some(event) = inner.events.pop_front() {
            let deliver = !inner.held.contains(&event.crtc)
                && !(inner.one_per_read && !delivered.is_empty());
            match deliver {
                true => delivered.push(event),
                false => kept.push_back(event),
            }
        }
        inner.events = kept;

        for event in &delivered {
            inner.in_flight.remove(&event.crtc);
        }

        self.signal(&mut inner);
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn readable(device: &FakeDevice) -> bool {
        let mut pollfd = libc::pollfd {
            fd: device.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        unsafe { libc::poll(&mut pollfd, 1, 0) == 1 }
    }

    #[test]
    fn events_are_signalled_through_the_descriptor() {
        let device = FakeDevice::with_outputs(&[(4, 4)]);
        let crtc = device.resources().unwrap().crtcs[0];
        assert!(!readable(&device));
        device.inject_event(crtc);
        assert!(readable(&device));

        let events = device.flip_events().unwrap();
        assert_eq!(events.len(), 1);
        assert!(!readable(&device));
    }

    #[test]
    fn one_event_per_read_keeps_descriptor_ready() {
        let device = FakeDevice::with_outputs(&[(4, 4), (4, 4)]);
        device.deliver_one_event_per_read(true);
        for crtc in device.resources().unwrap().crtcs {
            device.inject_event(crtc);
        }

        assert_eq!(device.flip_events().unwrap().len(), 1);
        assert!(readable(&device));
        assert_eq!(device.flip_events().unwrap().len(), 1);
        assert!(!readable(&device));
    }

    #[test]
    fn held_events_stay_queued() {
        let device = FakeDevice::with_outputs(&[(4, 4)]);
        let crtc = device.resources().unwrap().crtcs[0];
        device.hold_events(crtc);
        device.inject_event(crtc);

        assert!(device.flip_events().unwrap().is_empty());
        assert_eq!(device.pending_events(), 1);
    }
}
