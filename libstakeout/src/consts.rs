// Copyright 2024 Google LLC
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

pub const DEFAULT_HOST: &str = "127.0.0.1";

// 9000 is the Xdebug convention.
pub const DEFAULT_PORT: u16 = 9000;

/// Hard cap on a single frame payload. A runtime that claims more than
/// this is framing garbage, not paginating a big context.
pub const MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

/// How many lines of source to show on each side of the paused line.
pub const SOURCE_CONTEXT_LINES: usize = 5;
