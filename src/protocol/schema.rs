// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashSet;

use bytes::Buf;

use crate::buffer::Writer;
use crate::protocol::field::DONE_MARKER;
use crate::protocol::primitives::ensure_remaining;
use crate::protocol::{FieldDescriptor, Record, WireFieldType};
use crate::{AppError, AppResult};

///
/// Ordered field descriptors of one content type.
///
/// A schema always ends with a `done` descriptor: the encoder writes the marker byte after the
/// last field and the decoder stops there, requiring the marker to be present. Anything a
/// registration lists after `done` is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<FieldDescriptor>,
}

impl Schema {
    pub fn new(descriptors: Vec<FieldDescriptor>) -> AppResult<Schema> {
        let mut fields = Vec::with_capacity(descriptors.len() + 1);
        let mut names = HashSet::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if descriptor.field_type == WireFieldType::Done {
                break;
            }
            if !names.insert(descriptor.name.clone()) {
                return Err(AppError::InvalidValue(format!(
                    "field {} is declared twice",
                    descriptor.name
                )));
            }
            fields.push(descriptor);
        }
        fields.push(FieldDescriptor::new("end", WireFieldType::Done));
        Ok(Schema { fields })
    }

    /// Build a schema from the `FieldInfo` strings of a type registration.
    pub fn from_field_info<S: AsRef<str>>(field_info: &[S]) -> AppResult<Schema> {
        let descriptors = field_info
            .iter()
            .map(|s| s.as_ref().parse::<FieldDescriptor>())
            .collect::<AppResult<Vec<_>>>()?;
        Schema::new(descriptors)
    }

    pub fn field_info(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.to_string()).collect()
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn write_record(&self, record: &Record, writer: &mut Writer) -> AppResult<()> {
        for field in &self.fields {
            if field.field_type == WireFieldType::Done {
                writer.write_u8(DONE_MARKER);
                break;
            }
            let value = record.get(&field.name).ok_or_else(|| {
                AppError::InvalidValue(format!("record has no value for field {}", field.name))
            })?;
            field.field_type.encode(value, writer)?;
        }
        Ok(())
    }

    pub fn read_record<B: Buf>(&self, buffer: &mut B) -> AppResult<Record> {
        let mut record = Record::new();
        for field in &self.fields {
            if field.field_type == WireFieldType::Done {
                ensure_remaining(buffer, 1, "done marker")?;
                let marker = buffer.get_u8();
                if marker != DONE_MARKER {
                    return Err(AppError::MalformedProtocol(format!(
                        "expected done marker, found {:#04x}",
                        marker
                    )));
                }
                break;
            }
            let value = field.field_type.decode(buffer)?;
            record.insert(field.name.clone(), value);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::buffer::BufferPool;
    use crate::protocol::WireValue;

    fn article_schema() -> Schema {
        Schema::from_field_info(&["u32:id", "cstr:title", "cint:score"]).unwrap()
    }

    #[test]
    fn test_schema_always_ends_with_done() {
        let schema = article_schema();
        assert_eq!(schema.fields().len(), 4);
        assert_eq!(
            schema.fields().last().unwrap().field_type,
            WireFieldType::Done
        );
        assert_eq!(
            schema.field_info(),
            vec!["u32:id", "cstr:title", "cint:score", "done:end"]
        );
        // re-parsing the exchanged form gives the same schema
        assert_eq!(Schema::from_field_info(&schema.field_info()).unwrap(), schema);
    }

    #[test]
    fn test_fields_after_done_are_ignored() {
        let schema = Schema::from_field_info(&["u8:a", "done:end", "u8:b"]).unwrap();
        assert_eq!(schema.field_info(), vec!["u8:a", "done:end"]);
    }

    #[test]
    fn test_duplicate_field_names_rejected() {
        assert!(Schema::from_field_info(&["u8:a", "u16:a"]).is_err());
    }

    #[test]
    fn test_record_round_trip_and_stop_at_done() {
        let pool = BufferPool::new(4);
        let schema = article_schema();
        let record = Record::new()
            .with("id", WireValue::UInt(9))
            .with("title", "hello")
            .with("score", WireValue::Int(-5));

        let mut writer = Writer::new(&pool);
        schema.write_record(&record, &mut writer).unwrap();
        // trailing bytes belong to whoever comes after the message
        writer.write_bytes(b"tail");
        let chain = writer.finish();

        let mut reader = chain.reader();
        let decoded = schema.read_record(&mut reader).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(reader.remaining(), 4);
    }

    #[test]
    fn test_missing_done_marker_is_malformed() {
        let schema = Schema::from_field_info(&["u8:a"]).unwrap();
        let mut buffer = BytesMut::new();
        buffer.put_u8(1);
        buffer.put_u8(0x00);
        assert!(matches!(
            schema.read_record(&mut buffer),
            Err(AppError::MalformedProtocol(_))
        ));
    }

    #[test]
    fn test_missing_value_is_rejected() {
        let pool = BufferPool::new(4);
        let mut writer = Writer::new(&pool);
        let record = Record::new().with("id", WireValue::UInt(1));
        assert!(article_schema().write_record(&record, &mut writer).is_err());
    }
}
