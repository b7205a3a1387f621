use studytimer_core::Janitor;

use super::{print_json, CmdResult, Context};

pub fn run(dry_run: bool) -> CmdResult {
    let ctx = Context::open()?;
    let report = Janitor::new(&ctx.config.janitor).run(ctx.store.as_ref(), ctx.clock.now(), dry_run)?;
    print_json(&report)
}
