//! Tracked pose source and a simulated head tracker
//!
//! A [`HeadTracker`] is whatever reports head orientation: the platform VR
//! service on a device, or [`SimulatedHeadTracker`] in a desktop preview.
//! [`TrackedPoseSource`] samples it once per frame and collects device
//! events pushed from other threads through an [`EventSender`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use glam::{EulerRot, Mat4, Quat, Vec3};
use log::{debug, info, warn};

use crate::pose::{FrameEvents, MutablePose3D, Pose3D, PoseSource, FLIP_Z};
use crate::profile::DeviceProfile;
use crate::projection::Eye;

/// Source of head orientation.
pub trait HeadTracker {
    /// Current head view matrix (world to head), right-handed.
    fn head_view(&mut self) -> Mat4;

    /// Resets yaw so the current heading becomes forward.
    fn recenter(&mut self);

    /// Native profile parameter block, if the device can report one.
    fn device_params(&mut self) -> Option<Vec<f32>> {
        None
    }
}

/// Events the platform reports from its own threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Triggered,
    Tilted,
    ProfileChanged,
    BackButton,
}

impl DeviceEvent {
    /// Decodes the numeric event id used by native callbacks.
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(DeviceEvent::Triggered),
            2 => Some(DeviceEvent::Tilted),
            3 => Some(DeviceEvent::ProfileChanged),
            4 => Some(DeviceEvent::BackButton),
            _ => None,
        }
    }
}

type EventQueue = Arc<Mutex<VecDeque<DeviceEvent>>>;

/// Cloneable handle for pushing device events from any thread.
#[derive(Debug, Clone)]
pub struct EventSender {
    queue: EventQueue,
}

impl EventSender {
    pub fn send(&self, event: DeviceEvent) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(event);
    }

    /// Pushes an event by native id; unknown ids are logged and dropped.
    pub fn send_id(&self, id: i32) {
        match DeviceEvent::from_id(id) {
            Some(event) => self.send(event),
            None => warn!("Ignoring unknown device event id {}", id),
        }
    }
}

/// Pose source over a [`HeadTracker`], cached per frame.
pub struct TrackedPoseSource<T: HeadTracker> {
    tracker: T,
    profile: DeviceProfile,
    head: MutablePose3D,
    eyes: [MutablePose3D; 3],
    frame: Option<u64>,
    events: FrameEvents,
    queue: EventQueue,
}

impl<T: HeadTracker> TrackedPoseSource<T> {
    pub fn new(tracker: T, profile: DeviceProfile) -> Self {
        let mut source = Self {
            tracker,
            profile,
            head: MutablePose3D::new(),
            eyes: [MutablePose3D::new(); 3],
            frame: None,
            events: FrameEvents::default(),
            queue: Arc::new(Mutex::new(VecDeque::new())),
        };
        source.update_eye_poses();
        source
    }

    pub fn event_sender(&self) -> EventSender {
        EventSender { queue: Arc::clone(&self.queue) }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    fn update_eye_poses(&mut self) {
        let half = self.profile.viewer.lenses.separation / 2.0;
        self.eyes[0].set(Vec3::new(-half, 0.0, 0.0), Quat::IDENTITY);
        self.eyes[1].set(Vec3::new(half, 0.0, 0.0), Quat::IDENTITY);
        self.eyes[2].set(Vec3::ZERO, Quat::IDENTITY);
    }

    fn drain_events(&mut self) -> FrameEvents {
        let mut events = FrameEvents::default();
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        for event in queue.drain(..) {
            match event {
                DeviceEvent::Triggered => events.triggered = true,
                DeviceEvent::Tilted => events.tilted = true,
                DeviceEvent::ProfileChanged => events.profile_changed = true,
                DeviceEvent::BackButton => events.back_button_pressed = true,
            }
        }
        events
    }

    fn reload_profile(&mut self) {
        let Some(params) = self.tracker.device_params() else {
            return;
        };
        match DeviceProfile::from_native_params(&params) {
            Ok(profile) => {
                info!("Device profile updated from tracker");
                self.profile = profile;
                self.update_eye_poses();
            }
            Err(e) => warn!("Keeping previous device profile: {}", e),
        }
    }
}

impl<T: HeadTracker> PoseSource for TrackedPoseSource<T> {
    fn update_state(&mut self, frame: u64) -> FrameEvents {
        if self.frame == Some(frame) {
            return self.events;
        }
        self.frame = Some(frame);

        let head_view = self.tracker.head_view();
        self.head.set_right_handed(&head_view.inverse());

        self.events = self.drain_events();
        if self.events.profile_changed {
            self.reload_profile();
        }
        if self.events.any() {
            debug!("Frame {} events: {:?}", frame, self.events);
        }
        self.events
    }

    fn head_pose(&self) -> Pose3D {
        self.head.pose()
    }

    fn eye_pose(&self, eye: Eye) -> Pose3D {
        match eye {
            Eye::Left => self.eyes[0].pose(),
            Eye::Right => self.eyes[1].pose(),
            Eye::Center => self.eyes[2].pose(),
        }
    }

    fn current_profile(&self) -> Option<DeviceProfile> {
        Some(self.profile)
    }

    fn recenter(&mut self) {
        self.tracker.recenter();
    }
}

/// Neck pivot to eye center, meters.
const NECK_OFFSET: Vec3 = Vec3::new(0.0, 0.075, 0.08);
const MAX_TILT: f32 = 85.0;
/// Time constant of the automatic roll reset, seconds.
const UNTILT_TIME: f32 = 0.1;

/// Head tracker driven by yaw/pitch/roll deltas, for previews without
/// sensors.
#[derive(Debug, Clone)]
pub struct SimulatedHeadTracker {
    /// Degrees.
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    /// 0 disables the neck model, 1 is a full-size neck.
    pub neck_model_scale: f32,
    pub auto_untilt: bool,
    rolled: bool,
}

impl Default for SimulatedHeadTracker {
    fn default() -> Self {
        Self {
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            neck_model_scale: 0.0,
            auto_untilt: true,
            rolled: false,
        }
    }
}

impl SimulatedHeadTracker {
    pub fn new(neck_model_scale: f32) -> Self {
        Self { neck_model_scale, ..Default::default() }
    }

    /// Turns and nods the head. Yaw wraps to (-180, 180], pitch is clamped.
    pub fn rotate(&mut self, yaw: f32, pitch: f32) {
        self.yaw += yaw;
        if self.yaw <= -180.0 {
            self.yaw += 360.0;
        } else if self.yaw > 180.0 {
            self.yaw -= 360.0;
        }
        self.pitch = (self.pitch + pitch).clamp(-MAX_TILT, MAX_TILT);
    }

    /// Tilts the head sideways for this frame.
    pub fn tilt(&mut self, roll: f32) {
        self.roll = (self.roll + roll).clamp(-MAX_TILT, MAX_TILT);
        self.rolled = true;
    }

    /// Advances time; eases roll back to level unless tilted this frame.
    pub fn update(&mut self, dt: f32) {
        if !self.rolled && self.auto_untilt && dt > 0.0 {
            let t = dt / (dt + UNTILT_TIME);
            self.roll += (0.0 - self.roll) * t;
        }
        self.rolled = false;
    }

    pub fn orientation(&self) -> Quat {
        Quat::from_euler(
            EulerRot::YXZ,
            self.yaw.to_radians(),
            self.pitch.to_radians(),
            self.roll.to_radians(),
        )
    }

    /// Head position from the neck model, relative to the neck pivot
    /// level with the eyes.
    pub fn neck_position(&self) -> Vec3 {
        (self.orientation() * NECK_OFFSET - NECK_OFFSET.y * Vec3::Y) * self.neck_model_scale
    }

    /// Head-to-world transform in engine coordinates.
    pub fn head_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.orientation(), self.neck_position())
    }
}

impl HeadTracker for SimulatedHeadTracker {
    fn head_view(&mut self) -> Mat4 {
        (FLIP_Z * self.head_matrix() * FLIP_Z).inverse()
    }

    fn recenter(&mut self) {
        self.yaw = 0.0;
        self.pitch = 0.0;
        self.roll = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Turns a little further every time it is sampled.
    struct SpinningTracker {
        samples: u32,
        params: Option<Vec<f32>>,
    }

    impl HeadTracker for SpinningTracker {
        fn head_view(&mut self) -> Mat4 {
            self.samples += 1;
            Mat4::from_rotation_y(self.samples as f32 * 0.1).inverse()
        }

        fn recenter(&mut self) {
            self.samples = 0;
        }

        fn device_params(&mut self) -> Option<Vec<f32>> {
            self.params.take()
        }
    }

    fn source() -> TrackedPoseSource<SpinningTracker> {
        TrackedPoseSource::new(
            SpinningTracker { samples: 0, params: None },
            DeviceProfile::default(),
        )
    }

    #[test]
    fn head_pose_is_cached_within_a_frame() {
        let mut s = source();
        s.update_state(1);
        let a = s.head_pose();
        let b = s.head_pose();
        assert_eq!(a, b);

        // Same frame number again does not resample.
        s.update_state(1);
        assert_eq!(s.head_pose(), a);
        assert_eq!(s.tracker().samples, 1);

        s.update_state(2);
        assert_ne!(s.head_pose(), a);
    }

    #[test]
    fn events_last_exactly_one_frame() {
        let mut s = source();
        let sender = s.event_sender();
        sender.send(DeviceEvent::Triggered);
        sender.send_id(4);
        sender.send_id(99);

        let e = s.update_state(10);
        assert!(e.triggered && e.back_button_pressed);
        assert!(!e.tilted && !e.profile_changed);
        assert_eq!(s.update_state(10), e);
        assert!(!s.update_state(11).any());
    }

    #[test]
    fn events_arrive_from_other_threads() {
        let mut s = source();
        let sender = s.event_sender();
        std::thread::spawn(move || sender.send(DeviceEvent::Tilted))
            .join()
            .unwrap();
        assert!(s.update_state(1).tilted);
    }

    #[test]
    fn profile_change_reloads_native_params() {
        let mut s = source();
        let mut params = vec![
            50.0, 50.0, 50.0, 50.0, 0.133, 0.074, 0.004, 0.065, 0.036, 0.058, 1.0, 0.3, 0.0,
        ];
        s.tracker_mut().params = Some(params.clone());
        s.event_sender().send(DeviceEvent::ProfileChanged);
        assert!(s.update_state(1).profile_changed);
        let profile = s.current_profile().unwrap();
        assert_eq!(profile.viewer.lenses.separation, 0.065);
        assert!((s.eye_pose(Eye::Right).position().x - 0.0325).abs() < 1e-6);

        // A malformed block keeps the old profile.
        params.truncate(5);
        s.tracker_mut().params = Some(params);
        s.event_sender().send(DeviceEvent::ProfileChanged);
        s.update_state(2);
        assert_eq!(s.current_profile().unwrap(), profile);
    }

    #[test]
    fn simulated_yaw_wraps_and_pitch_clamps() {
        let mut t = SimulatedHeadTracker::default();
        t.rotate(170.0, 100.0);
        t.rotate(20.0, 0.0);
        assert!((t.yaw - -170.0).abs() < 1e-4);
        assert_eq!(t.pitch, MAX_TILT);
        // -180 is outside the range and wraps to +180.
        t.rotate(-10.0, 0.0);
        assert!((t.yaw - 180.0).abs() < 1e-4);
    }

    #[test]
    fn simulated_roll_eases_back() {
        let mut t = SimulatedHeadTracker::default();
        t.tilt(30.0);
        t.update(0.016);
        assert_eq!(t.roll, 30.0);
        for _ in 0..120 {
            t.update(0.016);
        }
        assert!(t.roll.abs() < 0.01);
    }

    #[test]
    fn neck_model_is_zero_when_looking_ahead() {
        let t = SimulatedHeadTracker::new(1.0);
        // Looking straight ahead the eyes sit forward of the pivot only.
        let p = t.neck_position();
        assert!(p.x.abs() < 1e-6 && p.y.abs() < 1e-6);
        assert!((p.z - 0.08).abs() < 1e-6);
    }

    #[test]
    fn simulated_pose_survives_handedness_conversion() {
        let mut t = SimulatedHeadTracker::new(1.0);
        t.rotate(30.0, -10.0);
        let mut s = TrackedPoseSource::new(t.clone(), DeviceProfile::default());
        s.update_state(1);
        let expected = Pose3D::from_matrix(&t.head_matrix());
        assert!((s.head_pose().position() - expected.position()).length() < 1e-5);
        assert!(s.head_pose().orientation().dot(expected.orientation()).abs() > 0.9999);
    }
}
