// Copyright (c) 2026 Embermesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Observability: Prometheus metrics and exposition.

pub mod metrics;
