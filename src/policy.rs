//! Loads, validates, and hot-reloads the Cedar policy that decides whether a
//! request exceeds its limits, and evaluates it against a per-request
//! entity graph.
//!
//! Grounded on two sources: the policy-language choice and the
//! `policy0`/`nolimits` convention come straight from
//! `internal/limiter/authorize.go` in the original source (which used
//! `cedar-go`); the hot-reload mechanics (watch the parent directory,
//! atomically swap a shared snapshot on successful recompile, keep serving
//! the old set on parse failure) are grounded on the `fsnotify` watcher in
//! that same file and on the `notify`-based watch loop in
//! `wash-cli/src/dev.rs`, adapted to swap an `ArcSwap` instead of sending a
//! reload signal to a single consumer.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use cedar_policy::{
	Authorizer, Context, Entities, Entity, EntityUid, Policy, PolicyId, PolicySet, Request,
	RestrictedExpression,
};
use notify::{EventKind, RecursiveMode, Watcher};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
	#[error("failed to read policy file {path}: {source}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse policy: {0}")]
	Parse(String),
	#[error("failed to build permit-all fallback policy: {0}")]
	Fallback(String),
	#[error("failed to construct entity {0}: {1}")]
	Entity(String, String),
	#[error("failed to build request: {0}")]
	Request(String),
}

const FALLBACK_POLICY_ID: &str = "nolimits";

const ALWAYS_PERMIT: &str = "permit (principal, action, resource);";

/// One evaluation against the currently loaded policy set.
#[derive(Debug, Clone)]
pub struct Diagnostic {
	pub allow: bool,
	pub reasons: Vec<String>,
	pub errors: Vec<String>,
}

/// Owns the hot-reloadable policy snapshot. Cheap to clone; the snapshot
/// pointer is shared, not duplicated.
#[derive(Clone)]
pub struct PolicyRuntime {
	current: Arc<ArcSwap<PolicySet>>,
	authorizer: Arc<Authorizer>,
}

impl PolicyRuntime {
	/// Load the policy file at `path`, install the permit-all fallback, and
	/// start watching for changes. A parse failure on the *initial* load
	/// still leaves the runtime serving the fallback alone (fail-open).
	pub async fn init(path: impl AsRef<Path>) -> Result<(Self, PolicyWatcherHandle), PolicyError> {
		let path = path.as_ref().to_path_buf();
		let initial = load_policy_set(&path).unwrap_or_else(|err| {
			warn!(error = %err, "initial policy load failed; serving permit-all fallback only");
			fallback_only()
		});

		let runtime = Self {
			current: Arc::new(ArcSwap::from_pointee(initial)),
			authorizer: Arc::new(Authorizer::new()),
		};

		let handle = runtime.clone().watch(path);
		Ok((runtime, handle))
	}

	fn watch(self, path: PathBuf) -> PolicyWatcherHandle {
		let (tx, mut rx) = mpsc::channel::<()>(1);
		let watch_path = path.clone();

		let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
			if let Ok(event) = res {
				if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
					let _ = tx.blocking_send(());
				}
			}
		})
		.expect("failed to construct filesystem watcher");

		// Watch the parent directory: atomic-replace writes (the common
		// case for editors and config management tools) can be missed if
		// we watch the bare file handle instead.
		let watch_dir = watch_path.parent().unwrap_or(Path::new(".")).to_path_buf();
		if let Err(err) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
			warn!(error = %err, dir = %watch_dir.display(), "failed to watch policy directory");
		}

		let runtime = self;
		let task = tokio::spawn(async move {
			// keep the watcher alive for the lifetime of the task
			let _watcher = watcher;
			while rx.recv().await.is_some() {
				match load_policy_set(&path) {
					Ok(new_set) => {
						runtime.current.store(Arc::new(new_set));
						info!(path = %path.display(), "policy reloaded");
					},
					Err(err) => {
						warn!(error = %err, "policy reload failed; keeping previous policy set");
					},
				}
			}
		});

		PolicyWatcherHandle { task }
	}

	/// Evaluate one (principal, action, resource, context) request against
	/// the currently loaded policy set.
	pub fn check(&self, req: PolicyRequest<'_>) -> Diagnostic {
		match self.try_check(req) {
			Ok(d) => d,
			Err(err) => {
				warn!(error = %err, "policy evaluation error; fail-open (admit)");
				Diagnostic {
					allow: true,
					reasons: vec![],
					errors: vec![err.to_string()],
				}
			},
		}
	}

	fn try_check(&self, req: PolicyRequest<'_>) -> Result<Diagnostic, PolicyError> {
		let policies = self.current.load();
		let entities = build_entities(req.entities)?;
		let request = Request::new(
			euid(req.principal_type, req.principal)?,
			euid("Action", req.action)?,
			req.resource.clone(),
			build_context(req.context)?,
			None,
		)
		.map_err(|e| PolicyError::Request(e.to_string()))?;

		let response = self.authorizer.is_authorized(&request, &policies, &entities);
		let allow = response.decision() == cedar_policy::Decision::Allow;
		let reasons = response.diagnostics().reason().map(|r| r.to_string()).collect();
		let errors = response.diagnostics().errors().map(|e| e.to_string()).collect();
		Ok(Diagnostic { allow, reasons, errors })
	}
}

pub struct PolicyWatcherHandle {
	task: tokio::task::JoinHandle<()>,
}

impl PolicyWatcherHandle {
	pub fn abort(&self) {
		self.task.abort();
	}
}

fn fallback_only() -> PolicySet {
	let mut set = PolicySet::new();
	let fallback = Policy::parse(Some(PolicyId::new(FALLBACK_POLICY_ID)), ALWAYS_PERMIT)
		.expect("ALWAYS_PERMIT is a fixed, valid policy");
	set.add(fallback).expect("fresh PolicySet always accepts the first policy");
	set
}

fn load_policy_set(path: &Path) -> Result<PolicySet, PolicyError> {
	let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
		path: path.display().to_string(),
		source,
	})?;

	// `PolicySet::from_str` parses a whole multi-policy file in one pass and
	// auto-assigns ids ("policy0", "policy1", ...) to unannotated policies,
	// matching the operator-policy naming convention this file follows.
	let mut combined = PolicySet::from_str(&raw).map_err(|e| PolicyError::Parse(e.to_string()))?;

	let fallback = Policy::parse(Some(PolicyId::new(FALLBACK_POLICY_ID)), ALWAYS_PERMIT)
		.map_err(|e| PolicyError::Fallback(e.to_string()))?;
	combined
		.add(fallback)
		.map_err(|e| PolicyError::Fallback(e.to_string()))?;

	Ok(combined)
}

/// One principal/resource pair worth of policy input. Constructed fresh per
/// check() call by the Decision Engine.
pub struct PolicyRequest<'a> {
	/// Entity type name of the principal: `"User"` for the jwt-derived
	/// pass, `"RemoteAddress"` for the peer-address pass.
	pub principal_type: &'a str,
	pub principal: &'a str,
	pub action: &'a str,
	pub resource: EntityUid,
	pub entities: &'a RequestEntities,
	pub context: &'a RequestContext,
}

/// The four-entity graph built per request: `User::"jwt"`,
/// `RemoteAddress::<peer>`, `Table::<table>`, `Function::<function>`.
pub struct RequestEntities {
	pub remote_address: String,
	pub table: Option<String>,
	pub function: Option<String>,
	pub claims: Map<String, Value>,
	pub user_requests_for_method: u64,
	pub remote_requests_for_method: u64,
}

/// Context record carried alongside every check: `remote_address`,
/// `user_total_requests`, `remote_total_requests`.
pub struct RequestContext {
	pub remote_address: String,
	pub user_total_requests: i64,
	pub remote_total_requests: i64,
}

pub fn resource_uid(table: Option<&str>, function: Option<&str>) -> Result<EntityUid, PolicyError> {
	match table {
		Some(t) if !t.is_empty() => euid("Table", t),
		_ => euid("Function", function.unwrap_or("")),
	}
}

fn euid(type_name: &str, id: &str) -> Result<EntityUid, PolicyError> {
	let escaped = id.replace('\\', "\\\\").replace('"', "\\\"");
	EntityUid::from_str(&format!("{type_name}::\"{escaped}\""))
		.map_err(|e| PolicyError::Entity(format!("{type_name}::\"{id}\""), e.to_string()))
}

fn build_context(ctx: &RequestContext) -> Result<Context, PolicyError> {
	let mut pairs = HashMap::new();
	pairs.insert(
		"remote_address".to_string(),
		RestrictedExpression::new_string(ctx.remote_address.clone()),
	);
	pairs.insert(
		"user_total_requests".to_string(),
		RestrictedExpression::new_long(ctx.user_total_requests),
	);
	pairs.insert(
		"remote_total_requests".to_string(),
		RestrictedExpression::new_long(ctx.remote_total_requests),
	);
	Context::from_pairs(pairs).map_err(|e| PolicyError::Request(e.to_string()))
}

fn build_entities(req: &RequestEntities) -> Result<Entities, PolicyError> {
	let mut out = Vec::with_capacity(4);

	let claim_attrs = req
		.claims
		.iter()
		.filter_map(|(k, v)| json_to_expr(v).map(|e| (k.clone(), e)))
		.collect::<HashMap<_, _>>();
	out.push(mk_entity("User", "jwt", claim_attrs)?);
	out.push(mk_entity("RemoteAddress", &req.remote_address, HashMap::new())?);

	let requests_attr = |user: u64, remote: u64| {
		let mut rec = HashMap::new();
		rec.insert("user".to_string(), RestrictedExpression::new_long(user as i64));
		rec.insert("remote".to_string(), RestrictedExpression::new_long(remote as i64));
		let mut attrs = HashMap::new();
		if let Ok(expr) = RestrictedExpression::new_record(rec) {
			attrs.insert("requests".to_string(), expr);
		}
		attrs
	};

	let table_id = req.table.clone().unwrap_or_default();
	out.push(mk_entity(
		"Table",
		&table_id,
		requests_attr(req.user_requests_for_method, req.remote_requests_for_method),
	)?);

	let function_id = req.function.clone().unwrap_or_default();
	out.push(mk_entity(
		"Function",
		&function_id,
		requests_attr(req.user_requests_for_method, req.remote_requests_for_method),
	)?);

	Entities::from_entities(out, None).map_err(|e| PolicyError::Entity("graph".to_string(), e.to_string()))
}

fn mk_entity(
	type_name: &str,
	id: &str,
	attrs: HashMap<String, RestrictedExpression>,
) -> Result<Entity, PolicyError> {
	let uid = euid(type_name, id)?;
	Entity::new(uid, attrs, HashSet::new())
		.map_err(|e| PolicyError::Entity(format!("{type_name}::\"{id}\""), e.to_string()))
}

fn json_to_expr(value: &Value) -> Option<RestrictedExpression> {
	match value {
		Value::String(s) => Some(RestrictedExpression::new_string(s.clone())),
		Value::Bool(b) => Some(RestrictedExpression::new_bool(*b)),
		Value::Number(n) => n.as_i64().map(RestrictedExpression::new_long),
		Value::Array(items) => {
			let elems: Vec<_> = items.iter().filter_map(json_to_expr).collect();
			Some(RestrictedExpression::new_set(elems))
		},
		Value::Object(map) => {
			let rec = map
				.iter()
				.filter_map(|(k, v)| json_to_expr(v).map(|e| (k.clone(), e)))
				.collect::<HashMap<_, _>>();
			RestrictedExpression::new_record(rec).ok()
		},
		Value::Null => None,
	}
}
