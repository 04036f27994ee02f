// kahi: workspace root package.
// Hosts the integration test suites under tests/integration; the
// supervisor itself lives in crates/ and services/kahid.
