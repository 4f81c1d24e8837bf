//! End-to-end tests for the ingot provisioning agent live in `tests/`.
