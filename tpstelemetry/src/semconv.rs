//! Attribute keys shared by the tracer, the sampler, the log bridge and the RPC metrics.

/// Callee (server side) service name of an RPC span.
pub const CALLEE_SERVICE: &str = "trpc.callee_service";
/// Callee method name of an RPC span.
pub const CALLEE_METHOD: &str = "trpc.callee_method";
/// Caller service name of an RPC span.
pub const CALLER_SERVICE: &str = "trpc.caller_service";
/// Caller method name of an RPC span.
pub const CALLER_METHOD: &str = "trpc.caller_method";
/// RPC framework return code.
pub const RPC_CODE: &str = "trpc.status_code";

/// Start attribute forcing a trace to be sampled when non-empty.
pub const FORCE_SAMPLE: &str = "trace.force.sample";
/// Trace-state key stamped on dyed traces.
pub const TRACE_DYEING: &str = "trace_dyeing";

/// Resource attribute carrying the tenant.
pub const TENANT_ID: &str = "tps.tenant.id";
/// Resource attribute carrying the service name.
pub const SERVICE_NAME: &str = "service.name";
/// Resource attribute carrying the service namespace.
pub const SERVICE_NAMESPACE: &str = "service.namespace";
/// Resource attribute carrying the service instance.
pub const SERVICE_INSTANCE: &str = "service.instance.id";
/// Resource attribute carrying the deployment environment name.
pub const ENV_NAME: &str = "tps.env.name";
/// Resource attribute carrying the deployment set name.
pub const SET_NAME: &str = "tps.set.name";
/// Resource attribute carrying the owners pushed by the control plane.
pub const SERVER_OWNER: &str = "server.owner";

/// Log record attribute recording the sampled flag of the surrounding trace.
pub const LOG_SAMPLED: &str = "sampled";
/// Log record attribute recording the source location.
pub const LOG_LINE: &str = "line";

/// gRPC metadata key carrying the tenant on every outgoing RPC.
pub const TENANT_HEADER: &str = "x-tps-tenantid";
