// Copyright 2026 the Trace Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end conformance tests for `trace_tape` live in `tests/`.
