//! keywarp IPC protocol
//!
//! Binary framing of the messages a client sends to the privileged
//! server: the serialized configuration, the active-context vector,
//! override-set activation and state validation, plus the one message
//! the server sends back (a triggered action index). All integers are
//! little-endian; mapping-level counts are `u16`, per-sequence event
//! counts are `u8`. Context filters are not transmitted, the client
//! evaluates them and only ships the compiled rules.

use keywarp_parser::cfg::{
    CommandOutput, Context, Input, MappingOverride, MappingOverrideSet, OutputRef,
};
use keywarp_parser::keys::Key;
use keywarp_parser::sequence::{KeyEvent, KeySequence, KeyState};
use std::io::{self, Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Configuration = 1,
    ActiveContexts = 2,
    SetActiveOverrideSet = 3,
    ValidateState = 4,
    TriggeredAction = 5,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Configuration,
            2 => Self::ActiveContexts,
            3 => Self::SetActiveOverrideSet,
            4 => Self::ValidateState,
            5 => Self::TriggeredAction,
            _ => return None,
        })
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn write_u8(writer: &mut impl Write, value: u8) -> io::Result<()> {
    writer.write_all(&[value])
}

fn write_u16(writer: &mut impl Write, value: u16) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_u32(writer: &mut impl Write, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_i16(writer: &mut impl Write, value: i16) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn read_u8(reader: &mut impl Read) -> io::Result<u8> {
    let mut buffer = [0; 1];
    reader.read_exact(&mut buffer)?;
    Ok(buffer[0])
}

fn read_u16(reader: &mut impl Read) -> io::Result<u16> {
    let mut buffer = [0; 2];
    reader.read_exact(&mut buffer)?;
    Ok(u16::from_le_bytes(buffer))
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buffer = [0; 4];
    reader.read_exact(&mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

fn read_i16(reader: &mut impl Read) -> io::Result<i16> {
    let mut buffer = [0; 2];
    reader.read_exact(&mut buffer)?;
    Ok(i16::from_le_bytes(buffer))
}

fn state_to_u8(state: KeyState) -> u8 {
    match state {
        KeyState::Up => 0,
        KeyState::Down => 1,
        KeyState::UpAsync => 2,
        KeyState::DownAsync => 3,
        KeyState::Not => 4,
        KeyState::DownMatched => 5,
        KeyState::OutputOnRelease => 6,
    }
}

fn state_from_u8(value: u8) -> Option<KeyState> {
    Some(match value {
        0 => KeyState::Up,
        1 => KeyState::Down,
        2 => KeyState::UpAsync,
        3 => KeyState::DownAsync,
        4 => KeyState::Not,
        5 => KeyState::DownMatched,
        6 => KeyState::OutputOnRelease,
        _ => return None,
    })
}

pub fn write_message_type(writer: &mut impl Write, message: MessageType) -> io::Result<()> {
    write_u8(writer, message as u8)
}

pub fn read_message_type(reader: &mut impl Read) -> io::Result<MessageType> {
    MessageType::from_u8(read_u8(reader)?).ok_or_else(|| invalid("unknown message type"))
}

pub fn write_key_sequence(writer: &mut impl Write, sequence: &[KeyEvent]) -> io::Result<()> {
    let count = u8::try_from(sequence.len()).map_err(|_| invalid("key sequence too long"))?;
    write_u8(writer, count)?;
    for event in sequence {
        write_u16(writer, event.key.0)?;
        write_u8(writer, state_to_u8(event.state))?;
    }
    Ok(())
}

pub fn read_key_sequence(reader: &mut impl Read) -> io::Result<KeySequence> {
    let count = read_u8(reader)?;
    let mut sequence = KeySequence::with_capacity(count.into());
    for _ in 0..count {
        let key = Key(read_u16(reader)?);
        let state =
            state_from_u8(read_u8(reader)?).ok_or_else(|| invalid("unknown key state"))?;
        sequence.push(KeyEvent::new(key, state));
    }
    Ok(sequence)
}

fn write_output_ref(writer: &mut impl Write, output: OutputRef) -> io::Result<()> {
    let encoded = match output {
        OutputRef::Sequence(index) => {
            i16::try_from(index).map_err(|_| invalid("output index out of range"))?
        }
        OutputRef::Command(command) => {
            let command = i16::try_from(command).map_err(|_| invalid("command out of range"))?;
            -command - 1
        }
    };
    write_i16(writer, encoded)
}

fn read_output_ref(reader: &mut impl Read) -> io::Result<OutputRef> {
    let encoded = read_i16(reader)?;
    Ok(if encoded >= 0 {
        OutputRef::Sequence(encoded as usize)
    } else {
        OutputRef::Command((-encoded - 1) as usize)
    })
}

/// Serializes the compiled rules the server needs to build its Stage:
/// every context's inputs, outputs and command bindings, followed by
/// the override sets.
pub fn write_configuration(
    writer: &mut impl Write,
    contexts: &[Context],
    override_sets: &[MappingOverrideSet],
) -> io::Result<()> {
    write_message_type(writer, MessageType::Configuration)?;

    let count = u16::try_from(contexts.len()).map_err(|_| invalid("too many contexts"))?;
    write_u16(writer, count)?;
    for context in contexts {
        write_u16(
            writer,
            u16::try_from(context.inputs.len()).map_err(|_| invalid("too many inputs"))?,
        )?;
        for input in &context.inputs {
            write_key_sequence(writer, &input.template)?;
            write_output_ref(writer, input.output)?;
        }
        write_u16(
            writer,
            u16::try_from(context.outputs.len()).map_err(|_| invalid("too many outputs"))?,
        )?;
        for output in &context.outputs {
            write_key_sequence(writer, output)?;
        }
        write_u16(
            writer,
            u16::try_from(context.command_outputs.len())
                .map_err(|_| invalid("too many command outputs"))?,
        )?;
        for command_output in &context.command_outputs {
            write_u16(
                writer,
                u16::try_from(command_output.index).map_err(|_| invalid("command out of range"))?,
            )?;
            write_key_sequence(writer, &command_output.output)?;
        }
    }

    let count = u16::try_from(override_sets.len()).map_err(|_| invalid("too many override sets"))?;
    write_u16(writer, count)?;
    for set in override_sets {
        write_u16(
            writer,
            u16::try_from(set.len()).map_err(|_| invalid("too many overrides"))?,
        )?;
        for entry in set {
            write_u16(
                writer,
                u16::try_from(entry.mapping_index).map_err(|_| invalid("index out of range"))?,
            )?;
            write_key_sequence(writer, &entry.output)?;
        }
    }
    Ok(())
}

/// Reads a configuration payload (after its message type byte). The
/// returned contexts carry no filters; those stay client-side.
pub fn read_configuration(
    reader: &mut impl Read,
) -> io::Result<(Vec<Context>, Vec<MappingOverrideSet>)> {
    let context_count = read_u16(reader)?;
    let mut contexts = Vec::with_capacity(context_count.into());
    for _ in 0..context_count {
        let mut context = Context::default();
        for _ in 0..read_u16(reader)? {
            let template = read_key_sequence(reader)?;
            let output = read_output_ref(reader)?;
            context.inputs.push(Input { template, output });
        }
        for _ in 0..read_u16(reader)? {
            context.outputs.push(read_key_sequence(reader)?);
        }
        for _ in 0..read_u16(reader)? {
            let index = read_u16(reader)?.into();
            let output = read_key_sequence(reader)?;
            context.command_outputs.push(CommandOutput { index, output });
        }
        contexts.push(context);
    }

    let set_count = read_u16(reader)?;
    let mut override_sets = Vec::with_capacity(set_count.into());
    for _ in 0..set_count {
        let mut set = MappingOverrideSet::new();
        for _ in 0..read_u16(reader)? {
            let mapping_index = read_u16(reader)?.into();
            let output = read_key_sequence(reader)?;
            set.push(MappingOverride {
                mapping_index,
                output,
            });
        }
        override_sets.push(set);
    }
    Ok((contexts, override_sets))
}

pub fn write_active_contexts(writer: &mut impl Write, indices: &[usize]) -> io::Result<()> {
    write_message_type(writer, MessageType::ActiveContexts)?;
    let count = u16::try_from(indices.len()).map_err(|_| invalid("too many active contexts"))?;
    write_u16(writer, count)?;
    for &index in indices {
        write_u16(
            writer,
            u16::try_from(index).map_err(|_| invalid("context index out of range"))?,
        )?;
    }
    Ok(())
}

pub fn read_active_contexts(reader: &mut impl Read) -> io::Result<Vec<usize>> {
    let count = read_u16(reader)?;
    let mut indices = Vec::with_capacity(count.into());
    for _ in 0..count {
        indices.push(read_u16(reader)?.into());
    }
    Ok(indices)
}

pub fn write_set_active_override_set(writer: &mut impl Write, index: u32) -> io::Result<()> {
    write_message_type(writer, MessageType::SetActiveOverrideSet)?;
    write_u32(writer, index)
}

pub fn write_validate_state(writer: &mut impl Write) -> io::Result<()> {
    write_message_type(writer, MessageType::ValidateState)
}

pub fn write_triggered_action(writer: &mut impl Write, action: u32) -> io::Result<()> {
    write_message_type(writer, MessageType::TriggeredAction)?;
    write_u32(writer, action)
}

pub fn read_u32_payload(reader: &mut impl Read) -> io::Result<u32> {
    read_u32(reader)
}
