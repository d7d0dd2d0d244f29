//! JSON encoding of everything sent to the broker. Separators are `", "` and
//! `": "`, which is what existing automations were written against.

use serde::Serialize;
use serde_json::ser::{Formatter, Serializer};
use std::io;

struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Encode a value as a JSON payload
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, String> {
    let mut buf = Vec::with_capacity(128);

    let mut ser = Serializer::with_formatter(&mut buf, SpacedFormatter);

    value
        .serialize(&mut ser)
        .map_err(|e| format!("json: {e}"))?;

    Ok(buf)
}
