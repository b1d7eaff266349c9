// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-level plumbing shared by every crate in the workspace.

pub mod syslog;

pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::trace;
pub use log::warn;
