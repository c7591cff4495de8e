// Device facade - resource creation, command list pooling and submission
//
// Every submission signals an internal timeline with the next counter value.
// Command lists of a submission (and through them every buffer, image and
// pipeline they recorded) stay in the pending queue until the timeline has
// reached that value, then `recycle` resets them for reuse.

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::buffer::{Buffer, BufferHandle, BufferInfo};
use super::command::{CommandList, ListState};
use super::image::{Image, ImageHandle, ImageInfo};
use super::pipeline::{GraphicsPipeline, GraphicsPipelineHandle, GraphicsPipelineInfo};
use super::raw::{RawDevice, RawSubmit};
use super::sync::{BinarySemaphore, TimelineSemaphore};

/// One queue submission.
///
/// Command lists are moved in and must be ended. Binary semaphores order the
/// work against other GPU work; timeline entries carry the value to wait for
/// or to signal.
#[derive(Default)]
pub struct SubmitInfo<'a> {
    pub command_lists: Vec<CommandList>,
    pub wait_binary_semaphores: Vec<&'a BinarySemaphore>,
    pub signal_binary_semaphores: Vec<&'a BinarySemaphore>,
    pub wait_timeline_semaphores: Vec<(&'a TimelineSemaphore, u64)>,
    pub signal_timeline_semaphores: Vec<(&'a TimelineSemaphore, u64)>,
}

/// Submitted work not yet known to be finished
struct PendingSubmit {
    timeline_value: u64,
    command_lists: Vec<CommandList>,
}

struct Submissions {
    last_value: u64,
    pending: VecDeque<PendingSubmit>,
}

pub struct Device {
    raw_device: Arc<dyn RawDevice>,
    submit_timeline: TimelineSemaphore,
    submissions: Mutex<Submissions>,
    free_command_lists: Mutex<Vec<CommandList>>,
}

impl Device {
    pub fn new(raw_device: Arc<dyn RawDevice>) -> Result<Self> {
        let submit_timeline = TimelineSemaphore::new(raw_device.clone(), 0, "submit timeline")
            .context("Failed to create submit timeline")?;

        Ok(Self {
            raw_device,
            submit_timeline,
            submissions: Mutex::new(Submissions {
                last_value: 0,
                pending: VecDeque::new(),
            }),
            free_command_lists: Mutex::new(Vec::new()),
        })
    }

    pub fn raw_device(&self) -> &Arc<dyn RawDevice> {
        &self.raw_device
    }

    // =========================================================================
    // RESOURCES
    // =========================================================================

    pub fn create_buffer(&self, info: &BufferInfo) -> Result<BufferHandle> {
        Buffer::new(self.raw_device.clone(), info)
            .with_context(|| format!("Failed to create buffer '{}'", info.name))
    }

    pub fn create_image_2d(&self, info: &ImageInfo) -> Result<ImageHandle> {
        Image::new(self.raw_device.clone(), info)
            .with_context(|| format!("Failed to create image '{}'", info.name))
    }

    pub fn create_graphics_pipeline(
        &self,
        info: &GraphicsPipelineInfo,
    ) -> Result<GraphicsPipelineHandle> {
        GraphicsPipeline::new(self.raw_device.clone(), info)
    }

    pub fn create_binary_semaphore(&self, name: &str) -> Result<BinarySemaphore> {
        BinarySemaphore::new(self.raw_device.clone(), name)
    }

    pub fn create_timeline_semaphore(
        &self,
        initial_value: u64,
        name: &str,
    ) -> Result<TimelineSemaphore> {
        TimelineSemaphore::new(self.raw_device.clone(), initial_value, name)
    }

    // =========================================================================
    // COMMAND LISTS
    // =========================================================================

    /// An Idle command list, recycled when one is available
    pub fn get_empty_command_list(&self) -> Result<CommandList> {
        if let Some(cmd) = self.free_command_lists.lock().pop() {
            return Ok(cmd);
        }
        log::debug!("Command list pool empty, allocating a new list");
        CommandList::new(self.raw_device.clone())
    }

    /// Submit ended command lists to the graphics queue.
    ///
    /// Returns the submit timeline value that marks completion of this work.
    pub fn submit(&self, info: SubmitInfo) -> Result<u64> {
        for (i, cmd) in info.command_lists.iter().enumerate() {
            assert!(
                cmd.state() == ListState::Ended,
                "command list {} must be ended before submission, it is {:?}",
                i,
                cmd.state()
            );
        }

        let command_buffers: Vec<vk::CommandBuffer> = info
            .command_lists
            .iter()
            .map(CommandList::vk_command_buffer)
            .collect();

        let wait_semaphores: Vec<(vk::Semaphore, u64)> = info
            .wait_binary_semaphores
            .iter()
            .map(|semaphore| (semaphore.vk_semaphore(), 0))
            .chain(
                info.wait_timeline_semaphores
                    .iter()
                    .map(|(semaphore, value)| (semaphore.vk_semaphore(), *value)),
            )
            .collect();

        // Held across the native submit so timeline values reach the queue in order
        let mut submissions = self.submissions.lock();
        let value = submissions.last_value + 1;

        let signal_semaphores: Vec<(vk::Semaphore, u64)> = info
            .signal_binary_semaphores
            .iter()
            .map(|semaphore| (semaphore.vk_semaphore(), 0))
            .chain(
                info.signal_timeline_semaphores
                    .iter()
                    .map(|(semaphore, value)| (semaphore.vk_semaphore(), *value)),
            )
            .chain(std::iter::once((self.submit_timeline.vk_semaphore(), value)))
            .collect();

        self.raw_device
            .queue_submit(&RawSubmit {
                command_buffers: &command_buffers,
                wait_semaphores: &wait_semaphores,
                signal_semaphores: &signal_semaphores,
            })
            .with_context(|| format!("Failed to submit work for timeline value {}", value))?;

        submissions.last_value = value;
        submissions.pending.push_back(PendingSubmit {
            timeline_value: value,
            command_lists: info.command_lists,
        });

        log::debug!(
            "Submitted {} command list(s), timeline value {}",
            command_buffers.len(),
            value
        );
        Ok(value)
    }

    /// Reset and pool the command lists of every finished submission
    pub fn recycle(&self) -> Result<()> {
        let completed = self.submit_timeline.value()?;

        let finished: Vec<PendingSubmit> = {
            let mut submissions = self.submissions.lock();
            let mut finished = Vec::new();
            while submissions
                .pending
                .front()
                .is_some_and(|submit| submit.timeline_value <= completed)
            {
                finished.extend(submissions.pending.pop_front());
            }
            finished
        };

        if finished.is_empty() {
            return Ok(());
        }

        let mut recycled = Vec::new();
        for submit in finished {
            for mut cmd in submit.command_lists {
                match cmd.reset() {
                    Ok(()) => recycled.push(cmd),
                    Err(e) => log::warn!("Dropping command list that failed to reset: {:#}", e),
                }
            }
        }

        log::debug!(
            "Recycled {} command list(s) up to timeline value {}",
            recycled.len(),
            completed
        );
        self.free_command_lists.lock().extend(recycled);
        Ok(())
    }

    /// Block until the GPU is idle, then recycle everything
    pub fn wait_idle(&self) -> Result<()> {
        self.raw_device.wait_idle()?;
        self.recycle()
    }

    /// Timeline signalled by every submission, for frame pacing
    pub fn submit_timeline(&self) -> &TimelineSemaphore {
        &self.submit_timeline
    }

    /// Value the timeline will reach once everything submitted so far is done
    pub fn last_submitted_value(&self) -> u64 {
        self.submissions.lock().last_value
    }

    pub fn pending_submissions(&self) -> usize {
        self.submissions.lock().pending.len()
    }

    pub fn free_command_lists(&self) -> usize {
        self.free_command_lists.lock().len()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Pending lists still reference resources the GPU may be using
        if let Err(e) = self.raw_device.wait_idle() {
            log::error!("Failed to wait for device idle on shutdown: {:#}", e);
        }
        self.submissions.lock().pending.clear();
        self.free_command_lists.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::command::{AttachmentDesc, RenderingDesc};
    use crate::backend::testing::{Call, FakeDevice};

    fn device(fake: &Arc<FakeDevice>) -> Device {
        Device::new(fake.clone()).unwrap()
    }

    fn ended_list(device: &Device) -> CommandList {
        let mut cmd = device.get_empty_command_list().unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        cmd
    }

    fn submits(fake: &FakeDevice) -> Vec<Call> {
        fake.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Submit { .. }))
            .collect()
    }

    #[test]
    fn submit_values_increase() {
        let fake = FakeDevice::new();
        let device = device(&fake);
        let first = device
            .submit(SubmitInfo {
                command_lists: vec![ended_list(&device)],
                ..Default::default()
            })
            .unwrap();
        let second = device
            .submit(SubmitInfo {
                command_lists: vec![ended_list(&device)],
                ..Default::default()
            })
            .unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(device.last_submitted_value(), 2);
        assert!(device.submit_timeline().wait_for_value(2, 0).unwrap());
    }

    #[test]
    fn submit_forwards_semaphores_and_signals_timeline() {
        let fake = FakeDevice::new();
        let device = device(&fake);
        let acquire = device.create_binary_semaphore("acquire").unwrap();
        let release = device.create_binary_semaphore("release").unwrap();
        let upload = device.create_timeline_semaphore(5, "upload").unwrap();
        let cmd = ended_list(&device);
        let raw_cmd = cmd.vk_command_buffer();

        device
            .submit(SubmitInfo {
                command_lists: vec![cmd],
                wait_binary_semaphores: vec![&acquire],
                signal_binary_semaphores: vec![&release],
                wait_timeline_semaphores: vec![(&upload, 5)],
                signal_timeline_semaphores: vec![(&upload, 6)],
            })
            .unwrap();

        assert_eq!(
            submits(&fake),
            vec![Call::Submit {
                command_buffers: vec![raw_cmd],
                waits: vec![(acquire.vk_semaphore(), 0), (upload.vk_semaphore(), 5)],
                signals: vec![
                    (release.vk_semaphore(), 0),
                    (upload.vk_semaphore(), 6),
                    (device.submit_timeline().vk_semaphore(), 1),
                ],
            }]
        );
        assert_eq!(upload.value().unwrap(), 6);
    }

    #[test]
    #[should_panic(expected = "must be ended")]
    fn submitting_a_recording_list_panics() {
        let fake = FakeDevice::new();
        let device = device(&fake);
        let mut cmd = device.get_empty_command_list().unwrap();
        cmd.begin().unwrap();
        let _ = device.submit(SubmitInfo {
            command_lists: vec![cmd],
            ..Default::default()
        });
    }

    #[test]
    fn failed_submit_does_not_consume_a_value() {
        let fake = FakeDevice::new();
        let device = device(&fake);
        let cmd = ended_list(&device);
        fake.fail_next_call();
        let err = device
            .submit(SubmitInfo {
                command_lists: vec![cmd],
                ..Default::default()
            })
            .unwrap_err();
        assert!(format!("{:#}", err).contains("timeline value 1"));
        assert!(submits(&fake).is_empty());
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(device.last_submitted_value(), 0);

        let value = device
            .submit(SubmitInfo {
                command_lists: vec![ended_list(&device)],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn resources_live_until_submission_completes() {
        let fake = FakeDevice::new();
        let device = device(&fake);
        fake.hold_submissions();

        let target = device.create_image_2d(&ImageInfo::default()).unwrap();
        let raw_image = target.vk_image();
        let mut cmd = device.get_empty_command_list().unwrap();
        let raw_cmd = cmd.vk_command_buffer();
        cmd.begin().unwrap();
        cmd.begin_rendering(&RenderingDesc {
            color_attachments: vec![AttachmentDesc::new(&target).clear_color([0.0; 4])],
            ..Default::default()
        });
        cmd.end_rendering();
        cmd.change_image_layout(&target, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        cmd.end().unwrap();

        let value = device
            .submit(SubmitInfo {
                command_lists: vec![cmd],
                ..Default::default()
            })
            .unwrap();
        drop(target);

        device.recycle().unwrap();
        assert_eq!(device.pending_submissions(), 1);
        assert!(!fake.calls().contains(&Call::DestroyImage(raw_image)));
        assert!(!device.submit_timeline().wait_for_value(value, 1_000_000).unwrap());

        fake.complete_submitted_work();
        device.recycle().unwrap();
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(device.free_command_lists(), 1);
        assert!(fake.calls().contains(&Call::DestroyImage(raw_image)));

        // The recycled list comes back idle
        let reused = device.get_empty_command_list().unwrap();
        assert_eq!(reused.vk_command_buffer(), raw_cmd);
        assert_eq!(reused.state(), ListState::Idle);
        assert!(reused.used_images().is_empty());
    }

    #[test]
    fn recycle_stops_at_first_unfinished_submission() {
        let fake = FakeDevice::new();
        let device = device(&fake);
        device
            .submit(SubmitInfo {
                command_lists: vec![ended_list(&device)],
                ..Default::default()
            })
            .unwrap();
        fake.hold_submissions();
        device
            .submit(SubmitInfo {
                command_lists: vec![ended_list(&device), ended_list(&device)],
                ..Default::default()
            })
            .unwrap();

        device.recycle().unwrap();
        assert_eq!(device.pending_submissions(), 1);
        assert_eq!(device.free_command_lists(), 1);
    }

    #[test]
    fn wait_idle_recycles_everything() {
        let fake = FakeDevice::new();
        let device = device(&fake);
        fake.hold_submissions();
        for _ in 0..3 {
            device
                .submit(SubmitInfo {
                    command_lists: vec![ended_list(&device)],
                    ..Default::default()
                })
                .unwrap();
        }
        assert_eq!(device.pending_submissions(), 3);

        device.wait_idle().unwrap();
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(device.free_command_lists(), 3);
        assert_eq!(device.submit_timeline().value().unwrap(), 3);
    }

    #[test]
    fn empty_submission_still_signals() {
        let fake = FakeDevice::new();
        let device = device(&fake);
        let value = device.submit(SubmitInfo::default()).unwrap();
        assert_eq!(value, 1);
        device.recycle().unwrap();
        assert_eq!(device.pending_submissions(), 0);
    }

    #[test]
    fn dropping_device_waits_for_gpu() {
        let fake = FakeDevice::new();
        let device = device(&fake);
        fake.hold_submissions();
        device
            .submit(SubmitInfo {
                command_lists: vec![ended_list(&device)],
                ..Default::default()
            })
            .unwrap();
        drop(device);

        let calls = fake.calls();
        let idle = calls.iter().position(|c| *c == Call::WaitIdle).unwrap();
        let freed = calls
            .iter()
            .position(|c| matches!(c, Call::DestroyCommandBuffer(..)))
            .unwrap();
        assert!(idle < freed);
    }
}
