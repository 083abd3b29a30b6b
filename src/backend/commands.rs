// Deferred command list
//
// Externally queued GPU work replayed into the command buffer at the
// start of every frame, ahead of the barrier/copy/dispatch sequence.
// Commands are plain data resolved against the registered buffers, so
// queueing and resolution are testable without a device; only the final
// replay touches ash.

use anyhow::Result;
use ash::vk;

/// One queued command, addressed by registration binding index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredCommand {
    /// Fill a registered buffer with a repeated 32-bit word.
    FillBuffer { binding: u32, value: u32 },
    /// Overwrite a byte range of a registered buffer inline. The data
    /// rides in the command buffer itself, so keep it small (the driver
    /// limit for inline updates is 65536 bytes).
    UpdateBuffer {
        binding: u32,
        offset: vk::DeviceSize,
        data: Vec<u8>,
    },
}

impl DeferredCommand {
    pub fn binding(&self) -> u32 {
        match self {
            DeferredCommand::FillBuffer { binding, .. } => *binding,
            DeferredCommand::UpdateBuffer { binding, .. } => *binding,
        }
    }
}

/// A command with its binding index resolved to the live buffer handle.
#[derive(Debug, Clone)]
pub enum ResolvedCommand<'a> {
    FillBuffer {
        buffer: vk::Buffer,
        value: u32,
    },
    UpdateBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &'a [u8],
    },
}

/// Resolve every queued command against the registry, preserving queue
/// order. A binding with no registered buffer is a caller error.
pub fn resolve<'a>(
    commands: &'a [DeferredCommand],
    lookup: impl Fn(u32) -> Option<vk::Buffer>,
) -> Result<Vec<ResolvedCommand<'a>>> {
    commands
        .iter()
        .map(|command| {
            let buffer = lookup(command.binding()).ok_or_else(|| {
                anyhow::anyhow!(
                    "Deferred command targets unregistered binding {}",
                    command.binding()
                )
            })?;
            Ok(match command {
                DeferredCommand::FillBuffer { value, .. } => ResolvedCommand::FillBuffer {
                    buffer,
                    value: *value,
                },
                DeferredCommand::UpdateBuffer { offset, data, .. } => {
                    ResolvedCommand::UpdateBuffer {
                        buffer,
                        offset: *offset,
                        data,
                    }
                }
            })
        })
        .collect()
}

/// Replay resolved commands into `cmd`, in order.
pub fn record(device: &ash::Device, cmd: vk::CommandBuffer, resolved: &[ResolvedCommand<'_>]) {
    for command in resolved {
        unsafe {
            match command {
                ResolvedCommand::FillBuffer { buffer, value } => {
                    device.cmd_fill_buffer(cmd, *buffer, 0, vk::WHOLE_SIZE, *value);
                }
                ResolvedCommand::UpdateBuffer {
                    buffer,
                    offset,
                    data,
                } => {
                    device.cmd_update_buffer(cmd, *buffer, *offset, data);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_buffer(id: u64) -> vk::Buffer {
        vk::Buffer::from_raw(id)
    }

    use ash::vk::Handle;

    #[test]
    fn resolution_preserves_queue_order() {
        let commands = vec![
            DeferredCommand::FillBuffer {
                binding: 2,
                value: 0xDEAD,
            },
            DeferredCommand::UpdateBuffer {
                binding: 1,
                offset: 16,
                data: vec![1, 2, 3, 4],
            },
            DeferredCommand::FillBuffer {
                binding: 1,
                value: 0,
            },
        ];

        let resolved = resolve(&commands, |binding| Some(fake_buffer(binding as u64))).unwrap();

        assert_eq!(resolved.len(), 3);
        assert!(matches!(
            resolved[0],
            ResolvedCommand::FillBuffer { value: 0xDEAD, .. }
        ));
        assert!(matches!(
            resolved[1],
            ResolvedCommand::UpdateBuffer { offset: 16, .. }
        ));
        assert!(matches!(
            resolved[2],
            ResolvedCommand::FillBuffer { value: 0, .. }
        ));
    }

    #[test]
    fn unknown_binding_is_rejected_at_resolution() {
        let commands = vec![DeferredCommand::FillBuffer {
            binding: 9,
            value: 1,
        }];

        let result = resolve(&commands, |_| None);

        assert!(result.is_err());
    }
}
