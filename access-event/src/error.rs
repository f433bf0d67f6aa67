// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use thiserror::Error;

/// Returned when trying to change a value that is fixed once the event has been captured
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot change {field} of {request_url}")]
pub struct UnsupportedOperation {
    /// Name of the field that was supposed to change
    pub field: &'static str,
    /// Request line of the event, for diagnostics
    pub request_url: String,
}
