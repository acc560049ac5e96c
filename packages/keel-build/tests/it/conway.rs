//! Conway boards: a grid of cell actions merged into one board tree per
//! generation. Generation zero comes from the configuration; later
//! generations consume the previous generation's board as an action
//! input. Rebuilding any board must not invoke the executor at all.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};

use keel_build::{
    ActionExecutionRequest, ActionExecutionResponse, ActionOptions, ActionSpec, Artifact,
    ArtifactKind, BuildSystem, ConfigurationFragment, ConfigurationKey, ConfiguredTarget,
    ConfiguredTargetKey, Executor, Label, Provider, Rule, RuleContext, provider,
};
use keel_cas::{CasDatabase, FileTreeStore, InMemoryCasDatabase};
use keel_engine::{FunctionCache, InMemoryFunctionCache, TypeTagged};

use crate::support::StaticTargets;

/// Board dimensions and initially live cells.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct BoardFragment {
    width: u32,
    height: u32,
    initial: Vec<(u32, u32)>,
}

impl TypeTagged for BoardFragment {
    const IDENTIFIER: &'static str = "conway-board";
}

impl ConfigurationFragment for BoardFragment {}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct BoardProvider {
    board: Artifact,
}

impl TypeTagged for BoardProvider {
    const IDENTIFIER: &'static str = "conway-board-provider";
}

impl Provider for BoardProvider {}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
struct Generation {
    generation: u32,
}

/// One cell action per board position, merged into the board directory.
/// Generation zero seeds from the configuration; later generations feed
/// the previous board into every cell action.
struct BoardRule;

#[async_trait]
impl Rule for BoardRule {
    async fn evaluate(
        &self,
        target: &ConfiguredTarget,
        ctx: &RuleContext,
    ) -> Result<Vec<Box<dyn keel_build::AnyProvider>>> {
        let board: BoardFragment = ctx.get_fragment()?;
        let generation: Generation = target.payload_as()?;
        let previous = if generation.generation == 0 {
            None
        } else {
            Some(ctx.get_provider::<BoardProvider>("previous")?.board)
        };

        let mut cells = Vec::new();
        for x in 0..board.width {
            for y in 0..board.height {
                let cell = ctx.declare_artifact(
                    format!("cells/{x}-{y}"),
                    ArtifactKind::Directory,
                )?;
                let (spec, inputs) = match &previous {
                    None => {
                        let alive = board.initial.contains(&(x, y));
                        let spec = ActionSpec::builder()
                            .arguments([
                                "conway-cell".to_string(),
                                x.to_string(),
                                y.to_string(),
                                if alive { "1".into() } else { "0".into() },
                            ])
                            .build();
                        (spec, vec![])
                    }
                    Some(previous) => {
                        let spec = ActionSpec::builder()
                            .arguments([
                                "conway-step".to_string(),
                                x.to_string(),
                                y.to_string(),
                                board.width.to_string(),
                                board.height.to_string(),
                            ])
                            .build();
                        (spec, vec![previous.clone()])
                    }
                };
                ctx.register_action(
                    spec,
                    inputs,
                    vec![cell.clone()],
                    ActionOptions::builder()
                        .mnemonic("ConwayCell")
                        .description(format!("cell ({x}, {y})"))
                        .build(),
                )?;
                cells.push((cell, None));
            }
        }

        let board_out = ctx.declare_artifact("board", ArtifactKind::Directory)?;
        ctx.register_merge_directories(cells, &board_out)?;
        Ok(vec![provider(BoardProvider { board: board_out })])
    }
}

/// Runs cell commands: seeds for generation zero, steps the automaton for
/// later generations by reading the previous board tree.
struct BoardExecutor {
    db: Arc<dyn CasDatabase>,
    invocations: AtomicUsize,
}

impl fmt::Debug for BoardExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardExecutor")
            .field("invocations", &self.invocations())
            .finish()
    }
}

impl BoardExecutor {
    fn new(db: Arc<dyn CasDatabase>) -> Self {
        Self {
            db,
            invocations: AtomicUsize::new(0),
        }
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    async fn cell_tree(&self, x: &str, y: &str, state: &str) -> Result<keel_cas::DataId> {
        let trees = FileTreeStore::new(Arc::clone(&self.db));
        let tree = trees
            .create_recursive([(format!("{x}/{y}"), state.as_bytes().to_vec())])
            .await?;
        Ok(tree.id().clone())
    }

    async fn step(&self, request: &ActionExecutionRequest) -> Result<keel_cas::DataId> {
        let args = &request.spec.arguments;
        let (x, y): (i64, i64) = (args[1].parse()?, args[2].parse()?);
        let (width, height): (i64, i64) = (args[3].parse()?, args[4].parse()?);

        let trees = FileTreeStore::new(Arc::clone(&self.db));
        let previous = trees.load(&request.inputs[0].id).await?;

        let mut live_neighbors = 0;
        for dx in -1..=1 {
            for dy in -1..=1 {
                if (dx, dy) == (0, 0) {
                    continue;
                }
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= width || ny >= height {
                    continue;
                }
                if read_cell(&trees, &previous, nx, ny).await? {
                    live_neighbors += 1;
                }
            }
        }
        let alive = read_cell(&trees, &previous, x, y).await?;
        let next = live_neighbors == 3 || (alive && live_neighbors == 2);

        self.cell_tree(&args[1], &args[2], if next { "1" } else { "0" }).await
    }
}

async fn read_cell(
    trees: &FileTreeStore,
    board: &keel_cas::Tree,
    x: i64,
    y: i64,
) -> Result<bool> {
    let Some((id, _)) = trees.lookup(board, &format!("{x}/{y}")).await? else {
        return Err(eyre!("previous board is missing cell ({x}, {y})"));
    };
    Ok(trees.get_file(&id).await? == b"1")
}

#[async_trait]
impl Executor for BoardExecutor {
    async fn execute(&self, request: ActionExecutionRequest) -> Result<ActionExecutionResponse> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let args = &request.spec.arguments;
        let output = match args[0].as_str() {
            "conway-cell" => self.cell_tree(&args[1], &args[2], &args[3]).await?,
            "conway-step" => self.step(&request).await?,
            other => return Err(eyre!("unknown command: {other}")),
        };
        Ok(ActionExecutionResponse::builder()
            .outputs(vec![output])
            .stdout_id(self.db.put(Vec::new(), Vec::new()).await?)
            .build())
    }
}

struct Fixture {
    db: Arc<dyn CasDatabase>,
    cache: Arc<dyn FunctionCache>,
    executor: Arc<BoardExecutor>,
}

impl Fixture {
    fn new() -> Self {
        let db: Arc<dyn CasDatabase> = Arc::new(InMemoryCasDatabase::new());
        Self {
            cache: Arc::new(InMemoryFunctionCache::new()),
            executor: Arc::new(BoardExecutor::new(Arc::clone(&db))),
            db,
        }
    }

    fn system(&self, generations: u32) -> Result<BuildSystem> {
        let mut targets = StaticTargets::new();
        for generation in 0..=generations {
            let mut target = ConfiguredTarget::new(
                Label::parse(&format!("//conway:gen-{generation}"))?,
                "conway-board-rule",
            )
            .with_payload(&Generation { generation })?;
            if generation > 0 {
                target = target.with_dependency(
                    "previous",
                    Label::parse(&format!("//conway:gen-{}", generation - 1))?,
                );
            }
            targets = targets.with(target);
        }

        BuildSystem::builder(Arc::clone(&self.db))
            .function_cache(Arc::clone(&self.cache))
            .executor(self.executor.clone())
            .target_delegate(Arc::new(targets))
            .rule("conway-board-rule", BoardRule)
            .build()
    }

    async fn key(&self, fragment: &BoardFragment, generation: u32) -> Result<ConfiguredTargetKey> {
        Ok(ConfiguredTargetKey {
            root_id: self.db.put(Vec::new(), Vec::new()).await?,
            label: Label::parse(&format!("//conway:gen-{generation}"))?,
            configuration: ConfigurationKey::new().with_fragment(fragment)?,
        })
    }
}

async fn board_cells(
    system: &BuildSystem,
    key: &ConfiguredTargetKey,
    fragment: &BoardFragment,
) -> Result<Vec<(u32, u32)>> {
    let value = system.evaluate_target(key).await?;
    let board: BoardProvider = value.providers().get()?;
    let materialized = system.request_artifact(&board.board).await?;

    let trees = system.tree_store();
    let tree = trees.load(&materialized.id).await?;
    let mut live = Vec::new();
    for x in 0..fragment.width {
        for y in 0..fragment.height {
            let (id, _) = trees
                .lookup(&tree, &format!("{x}/{y}"))
                .await?
                .ok_or_else(|| eyre!("missing cell ({x}, {y})"))?;
            if trees.get_file(&id).await? == b"1" {
                live.push((x, y));
            }
        }
    }
    Ok(live)
}

#[test_log::test(tokio::test)]
async fn generation_zero_board_has_the_live_cell() -> Result<()> {
    let fixture = Fixture::new();
    let system = fixture.system(0)?;
    let fragment = BoardFragment {
        width: 2,
        height: 2,
        initial: vec![(0, 0)],
    };

    let key = fixture.key(&fragment, 0).await?;
    let live = board_cells(&system, &key, &fragment).await?;
    assert_eq!(live, vec![(0, 0)]);
    assert_eq!(fixture.executor.invocations(), 4, "one execution per cell");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn second_build_reuses_every_cached_action() -> Result<()> {
    let fixture = Fixture::new();
    let fragment = BoardFragment {
        width: 2,
        height: 2,
        initial: vec![(0, 0)],
    };
    let key = fixture.key(&fragment, 0).await?;

    let first = board_cells(&fixture.system(0)?, &key, &fragment).await?;
    assert_eq!(fixture.executor.invocations(), 4);

    // A fresh build system over the same stores: everything replays from
    // the function cache, with zero executor invocations.
    let second = board_cells(&fixture.system(0)?, &key, &fragment).await?;
    assert_eq!(second, first);
    assert_eq!(fixture.executor.invocations(), 4, "no further executions");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn blinker_oscillates_into_the_next_generation() -> Result<()> {
    let fixture = Fixture::new();
    let system = fixture.system(1)?;
    // A vertical blinker in a 3x3 board.
    let fragment = BoardFragment {
        width: 3,
        height: 3,
        initial: vec![(1, 0), (1, 1), (1, 2)],
    };

    let key = fixture.key(&fragment, 1).await?;
    let live = board_cells(&system, &key, &fragment).await?;
    assert_eq!(live, vec![(0, 1), (1, 1), (2, 1)], "the blinker flipped horizontal");

    // 9 seed cells for generation zero plus 9 stepped cells.
    assert_eq!(fixture.executor.invocations(), 18);

    // Requesting generation one again replays both generations from cache.
    let again = board_cells(&system, &key, &fragment).await?;
    assert_eq!(again, live);
    assert_eq!(fixture.executor.invocations(), 18);
    Ok(())
}
