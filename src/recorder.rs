// Parallel secondary command buffer recording
//
// Fork-join over the thread pool: every object is owned by exactly one worker
// and gets one job per frame. The job animates the object, frustum-tests it
// and, if it survives, records its secondary command buffer. After the pool
// drains, the main thread collects only the visible objects' buffers.
//
// The GPU side sits behind `ObjectRecorder`, so the scheduling and culling
// logic runs the same with a fake recorder in tests.

use anyhow::{Context, Result};
use glam::Mat4;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;

use crate::frustum::Frustum;
use crate::scene::{ObjectData, PushConstantBlock};
use crate::thread_pool::ThreadPool;

/// Records the draw for one object into a pre-allocated target
pub trait ObjectRecorder: Send + Sync + 'static {
    /// Secondary command buffer handle (or a stand-in for it)
    type Target: Copy + Send + 'static;

    fn record(
        &self,
        target: Self::Target,
        object: &ObjectData,
        push_constants: &PushConstantBlock,
    ) -> Result<()>;
}

/// Read-only state shared by every job of one frame
#[derive(Debug, Clone, Copy)]
pub struct FrameState {
    pub frustum: Frustum,
    pub view_projection: Mat4,
    /// Animation step; zero freezes the scene
    pub frame_timer: f32,
    /// Bounding sphere radius used for culling
    pub cull_radius: f32,
}

/// Everything one worker touches: its objects, their push constant blocks
/// and one target per object for every frame in flight
pub struct WorkerSlot<T> {
    pub objects: Vec<ObjectData>,
    pub push_constants: Vec<PushConstantBlock>,
    pub targets: Vec<Vec<T>>,
}

pub struct ParallelRecorder<T> {
    // Slots go after the pool, so jobs still holding them finish first
    pool: ThreadPool,
    slots: Vec<Arc<Mutex<WorkerSlot<T>>>>,
}

impl<T: Copy + Send + 'static> ParallelRecorder<T> {
    /// Create one slot per pool worker with `objects_per_worker` scattered
    /// objects. `allocate(worker, count)` is called once per frame in flight
    /// and must hand back `count` targets owned by that worker.
    pub fn new<F>(
        pool: ThreadPool,
        objects_per_worker: usize,
        frames_in_flight: usize,
        rng: &mut impl Rng,
        mut allocate: F,
    ) -> Result<Self>
    where
        F: FnMut(usize, usize) -> Result<Vec<T>>,
    {
        let mut slots = Vec::with_capacity(pool.thread_count());

        for worker in 0..pool.thread_count() {
            let (objects, colors): (Vec<_>, Vec<_>) = (0..objects_per_worker)
                .map(|_| ObjectData::scatter(rng))
                .unzip();

            let push_constants = colors
                .into_iter()
                .map(|color| PushConstantBlock::new(Mat4::IDENTITY, color))
                .collect();

            let targets = (0..frames_in_flight)
                .map(|_| {
                    let targets = allocate(worker, objects_per_worker)?;
                    anyhow::ensure!(
                        targets.len() == objects_per_worker,
                        "worker {} got {} targets for {} objects",
                        worker,
                        targets.len(),
                        objects_per_worker
                    );
                    Ok(targets)
                })
                .collect::<Result<Vec<_>>>()?;

            slots.push(Arc::new(Mutex::new(WorkerSlot {
                objects,
                push_constants,
                targets,
            })));
        }

        log::info!(
            "Recording {} objects on {} workers ({} each)",
            objects_per_worker * slots.len(),
            slots.len(),
            objects_per_worker
        );

        Ok(Self { pool, slots })
    }

    /// Queue one job per object, wait for all of them, and return the
    /// targets of the objects that passed the frustum test, worker by worker.
    pub fn record_frame<R>(
        &self,
        frame_index: usize,
        frame: FrameState,
        recorder: Arc<R>,
    ) -> Result<Vec<T>>
    where
        R: ObjectRecorder<Target = T>,
    {
        let dispatched = self.dispatch(frame_index, Arc::new(frame), recorder);

        // Jobs queued before a dispatch error are still running
        let waited = self
            .pool
            .wait()
            .context("Secondary command buffer recording failed");

        dispatched?;
        waited?;

        Ok(self.visible_targets(frame_index))
    }

    fn dispatch<R>(&self, frame_index: usize, frame: Arc<FrameState>, recorder: Arc<R>) -> Result<()>
    where
        R: ObjectRecorder<Target = T>,
    {
        for (worker, slot) in self.slots.iter().enumerate() {
            let count = {
                let slot = slot.lock();
                anyhow::ensure!(
                    frame_index < slot.targets.len(),
                    "frame index {} out of range ({} frames in flight)",
                    frame_index,
                    slot.targets.len()
                );
                slot.objects.len()
            };

            for index in 0..count {
                let slot = Arc::clone(slot);
                let frame = Arc::clone(&frame);
                let recorder = Arc::clone(&recorder);
                self.pool.add_job(worker, move || {
                    record_object(&slot, index, frame_index, &frame, recorder.as_ref())
                })?;
            }
        }
        Ok(())
    }

    /// Targets of the currently visible objects. Only meaningful after
    /// `record_frame` returned.
    pub fn visible_targets(&self, frame_index: usize) -> Vec<T> {
        let mut visible = Vec::new();
        for slot in &self.slots {
            let slot = slot.lock();
            let Some(targets) = slot.targets.get(frame_index) else {
                continue;
            };
            visible.extend(
                slot.objects
                    .iter()
                    .zip(targets)
                    .filter(|(object, _)| object.visible)
                    .map(|(_, &target)| target),
            );
        }
        visible
    }

    pub fn object_count(&self) -> usize {
        self.slots.iter().map(|slot| slot.lock().objects.len()).sum()
    }

    pub fn visible_count(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.lock().objects.iter().filter(|o| o.visible).count())
            .sum()
    }
}

fn record_object<R: ObjectRecorder>(
    slot: &Mutex<WorkerSlot<R::Target>>,
    index: usize,
    frame_index: usize,
    frame: &FrameState,
    recorder: &R,
) -> Result<()> {
    let mut slot = slot.lock();
    let WorkerSlot {
        objects,
        push_constants,
        targets,
    } = &mut *slot;

    let object = &mut objects[index];
    object.animate(frame.frame_timer);
    // Stays false if recording errors or panics: a half-recorded buffer must
    // never reach the primary
    object.visible = false;
    if !frame.frustum.check_sphere(object.position, frame.cull_radius) {
        return Ok(());
    }

    let push = &mut push_constants[index];
    push.mvp = frame.view_projection * object.model;

    recorder
        .record(targets[frame_index][index], object, push)
        .with_context(|| format!("object {} at {:?}", index, object.position))?;
    object.visible = true;
    Ok(())
}

/// Split `object_count` evenly across `workers`; at least one per worker
pub fn objects_per_worker(object_count: usize, workers: usize) -> usize {
    (object_count / workers.max(1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Stand-in for a secondary command buffer: (worker, object)
    type FakeBuffer = (usize, usize);

    #[derive(Default)]
    struct CountingRecorder {
        recorded: Mutex<Vec<FakeBuffer>>,
        calls: AtomicUsize,
    }

    impl ObjectRecorder for CountingRecorder {
        type Target = FakeBuffer;

        fn record(&self, target: FakeBuffer, _: &ObjectData, _: &PushConstantBlock) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.recorded.lock().push(target);
            Ok(())
        }
    }

    struct FailingRecorder;

    impl ObjectRecorder for FailingRecorder {
        type Target = FakeBuffer;

        fn record(&self, target: FakeBuffer, _: &ObjectData, _: &PushConstantBlock) -> Result<()> {
            if target.1 == 0 {
                anyhow::bail!("device lost");
            }
            Ok(())
        }
    }

    struct PanickingRecorder;

    impl ObjectRecorder for PanickingRecorder {
        type Target = FakeBuffer;

        fn record(&self, target: FakeBuffer, _: &ObjectData, _: &PushConstantBlock) -> Result<()> {
            assert_ne!(target.1, 1, "recording blew up");
            Ok(())
        }
    }

    fn fake_recorder(workers: usize, per_worker: usize, frames: usize) -> ParallelRecorder<FakeBuffer> {
        let pool = ThreadPool::new(workers).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        ParallelRecorder::new(pool, per_worker, frames, &mut rng, |worker, count| {
            Ok((0..count).map(|i| (worker, i)).collect())
        })
        .unwrap()
    }

    /// Camera at the origin looking down -Z, 60 degree FOV, far plane 256
    fn origin_frame() -> FrameState {
        let projection = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 256.0);
        FrameState {
            frustum: Frustum::from_matrix(projection),
            view_projection: projection,
            frame_timer: 0.0,
            cull_radius: 1.0,
        }
    }

    #[test]
    fn objects_are_split_evenly() {
        assert_eq!(objects_per_worker(512, 8), 64);
        assert_eq!(objects_per_worker(128, 4), 32);
        assert_eq!(objects_per_worker(3, 8), 1);
        assert_eq!(objects_per_worker(10, 0), 10);
    }

    #[test]
    fn culled_objects_are_left_out_of_the_frame() {
        let recorder = fake_recorder(4, 32, 1);
        assert_eq!(recorder.object_count(), 128);

        // Every fourth object far off to the side, the rest straight ahead
        for worker in 0..4 {
            let mut slot = recorder.slots[worker].lock();
            for (i, object) in slot.objects.iter_mut().enumerate() {
                object.position = if i % 4 == 0 {
                    Vec3::new(1000.0, 0.0, 0.0)
                } else {
                    Vec3::new(i as f32 - 16.0, 0.0, -100.0)
                };
            }
        }

        let counting = Arc::new(CountingRecorder::default());
        let submitted = recorder
            .record_frame(0, origin_frame(), Arc::clone(&counting))
            .unwrap();

        assert_eq!(submitted.len(), 96);
        assert!(submitted.iter().all(|&(_, i)| i % 4 != 0));
        assert_eq!(counting.calls.load(Ordering::SeqCst), 96);
        assert_eq!(recorder.visible_count(), 96);

        // Worker order, then object order
        let mut sorted = submitted.clone();
        sorted.sort();
        assert_eq!(submitted, sorted);
    }

    #[test]
    fn every_visible_object_is_recorded_once_per_frame() {
        let recorder = fake_recorder(3, 10, 2);
        for worker in 0..3 {
            let mut slot = recorder.slots[worker].lock();
            for object in &mut slot.objects {
                object.position = Vec3::new(0.0, 0.0, -20.0);
            }
        }

        let counting = Arc::new(CountingRecorder::default());
        for frame in 0..4 {
            let submitted = recorder
                .record_frame(frame % 2, origin_frame(), Arc::clone(&counting))
                .unwrap();
            assert_eq!(submitted.len(), 30);
        }

        assert_eq!(counting.calls.load(Ordering::SeqCst), 120);
        let mut recorded = counting.recorded.lock().clone();
        recorded.sort();
        recorded.dedup();
        assert_eq!(recorded.len(), 30);
    }

    #[test]
    fn push_constants_carry_the_model_view_projection() {
        let recorder = fake_recorder(1, 4, 1);
        let frame = origin_frame();
        recorder
            .record_frame(0, frame, Arc::new(CountingRecorder::default()))
            .unwrap();

        let slot = recorder.slots[0].lock();
        for (object, push) in slot.objects.iter().zip(&slot.push_constants) {
            if object.visible {
                assert_eq!(push.mvp, frame.view_projection * object.model);
            }
        }
    }

    #[test]
    fn failed_recordings_are_reported_and_not_submitted() {
        let recorder = fake_recorder(2, 5, 1);
        for worker in 0..2 {
            let mut slot = recorder.slots[worker].lock();
            for object in &mut slot.objects {
                object.position = Vec3::new(0.0, 0.0, -20.0);
            }
        }

        let err = recorder
            .record_frame(0, origin_frame(), Arc::new(FailingRecorder))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("device lost"));

        let visible = recorder.visible_targets(0);
        assert_eq!(visible.len(), 8);
        assert!(visible.iter().all(|&(_, i)| i != 0));
    }

    #[test]
    fn panicking_recordings_are_not_submitted() {
        let recorder = fake_recorder(2, 3, 1);
        for worker in 0..2 {
            let mut slot = recorder.slots[worker].lock();
            for object in &mut slot.objects {
                object.position = Vec3::new(0.0, 0.0, -20.0);
            }
        }

        assert!(recorder
            .record_frame(0, origin_frame(), Arc::new(PanickingRecorder))
            .is_err());

        let visible = recorder.visible_targets(0);
        assert_eq!(visible, vec![(0, 0), (0, 2), (1, 0), (1, 2)]);
    }

    #[test]
    fn target_allocation_must_match_object_count() {
        let pool = ThreadPool::new(2).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let result = ParallelRecorder::new(pool, 4, 1, &mut rng, |_, count| {
            Ok(vec![0u32; count - 1])
        });
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_frame_is_rejected() {
        let recorder = fake_recorder(1, 2, 2);
        let result = recorder.record_frame(2, origin_frame(), Arc::new(CountingRecorder::default()));
        assert!(result.is_err());
    }
}
