// notifeed: a small pub/sub notification system over a reliable
// request/response transport built on UDP.
//
// The implementation lives in the workspace members: `nf-proto` (types and
// wire codec), `nf-transport` (the reliability layer), `services/server`
// (the profile/notification engine) and `services/client` (session API and
// binary).  This root target only anchors the end-to-end suites declared
// in Cargo.toml.
