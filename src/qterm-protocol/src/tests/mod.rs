//! Tests for qterm-protocol
