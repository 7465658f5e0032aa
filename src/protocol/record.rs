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

use crate::protocol::WireValue;

///
/// Field values of one entity, in schema order.
///
/// Lookups are linear; content schemas are a handful of fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: Vec<(String, WireValue)>,
}

impl Record {
    pub fn new() -> Self {
        Record { values: Vec::new() }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<WireValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set a field, replacing an existing value of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<WireValue>) {
        let name = name.into();
        let value = value.into();
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&WireValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &WireValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }
}
