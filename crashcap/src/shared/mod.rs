// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants and configuration shared between the collector and the handler executable.

pub mod configuration;
pub mod constants;
