//! Built-in component units.
//!
//! Arguments come from the root request, e.g. `web:h1,h2,tag=web` or
//! `setup:on=web,at=-10,cmd=/usr/bin/install-deps,timeout=60`.
//!
//! | unit         | arguments                                                  |
//! |--------------|------------------------------------------------------------|
//! | `core.hosts` | positional host names, `kind`, `tag`                       |
//! | `core.links` | positional `a-b` pairs, `mirror` (`+`-separated names)     |
//! | `core.run`   | `on`/`vertex`, `at`, `cmd` or `script`, `timeout`, args     |
//! | `core.drop`  | `on`/`vertex`, `at`, `resource`, `dest`, `mode` (octal)     |
//! | `core.pause` | `on`/`vertex`, `at`, `duration`                            |
//! | `core.break` | `on`/`vertex`, `at`                                        |
//! | `core.resume`| `on`/`vertex`, `at`, `targets` (`+`-separated names)       |

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};

use emulation_kernel::graph::VertexId;
use emulation_kernel::schedule::{Action, ExecutableRef, ResumeTargets};
use emulation_kernel::{ComponentUnit, ExperimentGraph, UnitContext, UnitTable};

/// Decoration every host added by `core.hosts` carries.
pub const HOST: &str = "host";

/// Table with every built-in unit registered.
pub fn builtin_units() -> UnitTable {
    UnitTable::new()
        .register(Hosts)
        .register(Links)
        .register(Run)
        .register(DropResource)
        .register(Pause)
        .register(Break)
        .register(Resume)
}

/// Vertices a scheduling unit applies to.
fn targets(graph: &ExperimentGraph, ctx: &UnitContext) -> Result<Vec<VertexId>> {
    if let Some(name) = ctx.arg("vertex") {
        let id = graph
            .find_vertex(name)
            .with_context(|| format!("{}: no vertex named `{name}`", ctx.component))?;
        return Ok(vec![id]);
    }
    let decoration = ctx.arg("on").unwrap_or(HOST);
    let ids = graph.vertices_with(decoration);
    if ids.is_empty() {
        bail!("{}: no vertex decorated `{decoration}`", ctx.component);
    }
    Ok(ids)
}

fn number(ctx: &UnitContext, key: &str) -> Result<Option<f64>> {
    ctx.arg(key)
        .map(|raw| {
            raw.parse::<f64>()
                .with_context(|| format!("{}: `{key}` must be a number, got `{raw}`", ctx.component))
        })
        .transpose()
}

fn start_time(ctx: &UnitContext) -> Result<f64> {
    Ok(number(ctx, "at")?.unwrap_or(0.0))
}

fn schedule_on_targets(graph: &mut ExperimentGraph, ctx: &UnitContext, action: Action) -> Result<()> {
    let at = start_time(ctx)?;
    for id in targets(graph, ctx)? {
        graph.schedule_action(id, at, action.clone())?;
    }
    Ok(())
}

fn names(list: &str) -> Vec<String> {
    list.split('+')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

struct Hosts;

impl ComponentUnit for Hosts {
    fn name(&self) -> &str {
        "core.hosts"
    }

    fn build(&self, graph: &mut ExperimentGraph, ctx: &UnitContext) -> Result<()> {
        if ctx.positional.is_empty() {
            bail!("{}: no host names given", ctx.component);
        }
        let kind = ctx.arg("kind").unwrap_or("vm");
        for name in &ctx.positional {
            let id = graph.add_vertex(name.as_str(), kind)?;
            graph.decorate_vertex(id, HOST)?;
            if let Some(tag) = ctx.arg("tag") {
                graph.decorate_vertex(id, tag)?;
            }
        }
        Ok(())
    }
}

struct Links;

impl ComponentUnit for Links {
    fn name(&self) -> &str {
        "core.links"
    }

    fn build(&self, graph: &mut ExperimentGraph, ctx: &UnitContext) -> Result<()> {
        let mirror = ctx.arg("mirror").map(names).unwrap_or_default();
        for pair in &ctx.positional {
            let (a, b) = pair
                .split_once('-')
                .with_context(|| format!("{}: link `{pair}` must be a-b", ctx.component))?;
            let find = |name: &str| {
                graph
                    .find_vertex(name)
                    .with_context(|| format!("{}: no vertex named `{name}`", ctx.component))
            };
            let (a, b) = (find(a)?, find(b)?);

            let mut attributes = BTreeMap::new();
            if !mirror.is_empty() {
                attributes.insert("mirror".to_string(), serde_json::json!(mirror));
            }
            graph.add_edge(a, b, attributes)?;
        }
        Ok(())
    }
}

struct Run;

impl ComponentUnit for Run {
    fn name(&self) -> &str {
        "core.run"
    }

    fn build(&self, graph: &mut ExperimentGraph, ctx: &UnitContext) -> Result<()> {
        let program = match (ctx.arg("cmd"), ctx.arg("script")) {
            (Some(cmd), None) => ExecutableRef::Path(cmd.to_string()),
            (None, Some(key)) => {
                let path = ctx
                    .resource(key)
                    .with_context(|| format!("{}: no resource `{key}`", ctx.component))?;
                let bytes = std::fs::read(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(key)
                    .to_string();
                ExecutableRef::Inline { name, bytes }
            }
            _ => bail!("{}: exactly one of `cmd` or `script` is required", ctx.component),
        };
        let action = Action::RunExecutable {
            program,
            args: ctx.positional.clone(),
            timeout_seconds: number(ctx, "timeout")?,
        };
        schedule_on_targets(graph, ctx, action)
    }
}

struct DropResource;

impl ComponentUnit for DropResource {
    fn name(&self) -> &str {
        "core.drop"
    }

    fn build(&self, graph: &mut ExperimentGraph, ctx: &UnitContext) -> Result<()> {
        let key = ctx
            .arg("resource")
            .with_context(|| format!("{}: `resource` is required", ctx.component))?;
        let source = ctx
            .resource(key)
            .with_context(|| format!("{}: no resource `{key}`", ctx.component))?;
        let content =
            std::fs::read(source).with_context(|| format!("reading {}", source.display()))?;
        let path = match ctx.arg("dest") {
            Some(dest) => dest.to_string(),
            None => source
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(key)
                .to_string(),
        };
        let mode = ctx
            .arg("mode")
            .map(|m| {
                u32::from_str_radix(m, 8)
                    .with_context(|| format!("{}: mode `{m}` is not octal", ctx.component))
            })
            .transpose()?;
        schedule_on_targets(graph, ctx, Action::DropContent { path, content, mode })
    }
}

struct Pause;

impl ComponentUnit for Pause {
    fn name(&self) -> &str {
        "core.pause"
    }

    fn build(&self, graph: &mut ExperimentGraph, ctx: &UnitContext) -> Result<()> {
        let duration = number(ctx, "duration")?
            .with_context(|| format!("{}: `duration` is required", ctx.component))?;
        schedule_on_targets(graph, ctx, Action::Pause { duration })
    }
}

struct Break;

impl ComponentUnit for Break {
    fn name(&self) -> &str {
        "core.break"
    }

    fn build(&self, graph: &mut ExperimentGraph, ctx: &UnitContext) -> Result<()> {
        schedule_on_targets(graph, ctx, Action::Break)
    }
}

struct Resume;

impl ComponentUnit for Resume {
    fn name(&self) -> &str {
        "core.resume"
    }

    fn build(&self, graph: &mut ExperimentGraph, ctx: &UnitContext) -> Result<()> {
        let targets = match ctx.arg("targets") {
            Some(list) => ResumeTargets::Vertices(names(list)),
            None => ResumeTargets::All,
        };
        schedule_on_targets(graph, ctx, Action::ResumeMarker { targets })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use emulation_kernel::RootRequest;

    fn ctx(request: &str) -> UnitContext {
        let request: RootRequest = request.parse().unwrap();
        UnitContext {
            component: request.name,
            positional: request.positional,
            named: request.named,
            resources: BTreeMap::new(),
        }
    }

    fn hosts(graph: &mut ExperimentGraph, request: &str) {
        Hosts.build(graph, &ctx(request)).unwrap();
    }

    #[test]
    fn hosts_and_links_shape_the_topology() {
        let mut graph = ExperimentGraph::new();
        hosts(&mut graph, "web:h1,h2,tag=web");
        hosts(&mut graph, "db:d1");
        Links
            .build(&mut graph, &ctx("net:h1-d1,h2-d1,mirror=h1"))
            .unwrap();

        assert_eq!(graph.vertex_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.vertices_with("web").len(), 2);
        assert_eq!(graph.vertices_with(HOST).len(), 3);

        let frozen = graph.freeze();
        let edge = frozen.find_edge("d1", "h1").unwrap();
        assert_eq!(edge.attributes["mirror"], serde_json::json!(["h1"]));
    }

    #[test]
    fn run_schedules_on_decorated_vertices() {
        let mut graph = ExperimentGraph::new();
        hosts(&mut graph, "web:h1,h2,tag=web");
        hosts(&mut graph, "db:d1");
        Run.build(
            &mut graph,
            &ctx("setup:--quiet,on=web,at=-inf,cmd=/bin/true,timeout=30"),
        )
        .unwrap();

        let schedules = graph.freeze().schedules();
        assert_eq!(schedules.len(), 2);
        let entry = schedules["h1"].iter().next().unwrap();
        assert_eq!(entry.start_time, f64::NEG_INFINITY);
        assert_eq!(
            entry.action,
            Action::RunExecutable {
                program: ExecutableRef::Path("/bin/true".into()),
                args: vec!["--quiet".into()],
                timeout_seconds: Some(30.0),
            }
        );
    }

    #[test]
    fn drop_reads_the_resource_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("motd");
        std::fs::write(&file, b"hello").unwrap();

        let mut graph = ExperimentGraph::new();
        hosts(&mut graph, "web:h1");
        let mut context = ctx("motd:vertex=h1,at=-5,resource=motd,dest=etc/motd,mode=644");
        context.resources.insert("motd".into(), PathBuf::from(&file));
        DropResource.build(&mut graph, &context).unwrap();

        let schedules = graph.freeze().schedules();
        let entry = schedules["h1"].iter().next().unwrap();
        assert_eq!(
            entry.action,
            Action::DropContent {
                path: "etc/motd".into(),
                content: b"hello".to_vec(),
                mode: Some(0o644),
            }
        );
    }

    #[test]
    fn suspensions_are_nudged_past_their_time() {
        let mut graph = ExperimentGraph::new();
        hosts(&mut graph, "web:h1");
        Pause.build(&mut graph, &ctx("p:at=10,duration=5")).unwrap();
        Resume
            .build(&mut graph, &ctx("r:at=20,targets=h1+h2"))
            .unwrap();

        let schedules = graph.freeze().schedules();
        let entries: Vec<_> = schedules["h1"].iter().collect();
        assert!(entries[0].start_time > 10.0);
        assert_eq!(entries[0].authored_time, 10.0);
        assert_eq!(
            entries[1].action,
            Action::ResumeMarker {
                targets: ResumeTargets::Vertices(vec!["h1".into(), "h2".into()])
            }
        );
    }

    #[test]
    fn missing_targets_are_reported() {
        let mut graph = ExperimentGraph::new();
        let err = Break.build(&mut graph, &ctx("b:on=web")).unwrap_err();
        assert!(err.to_string().contains("no vertex decorated `web`"));
        let err = Run.build(&mut graph, &ctx("r:on=web")).unwrap_err();
        assert!(err.to_string().contains("exactly one of"));
    }
}
