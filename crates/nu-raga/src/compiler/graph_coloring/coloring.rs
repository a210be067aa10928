//! Color assignment

use super::*;

impl<'t, T: Target + ?Sized> Raga<'t, T> {
    /// Pop the select stack, giving each node a register none of its
    /// colored neighbors overlaps. Caller-saved registers are preferred;
    /// callee-saved ones are the fallback.
    pub(super) fn assign_colors(&mut self) {
        let model = self.model();

        while let Some(n) = self.select_stack.pop(&mut self.nodes) {
            let class = self.nodes[n].class_id;
            let mut excluded = if self.omits_hard_regs() {
                self.nodes[n].excluded
            } else {
                RegSet::empty()
            };

            for w in self.nodes[n].adj_list.clone() {
                let a = self.get_alias(w);
                if matches!(
                    self.nodes[a].state,
                    NodeState::Colored | NodeState::Precolored
                ) && let Some(color) = self.nodes[a].color
                {
                    excluded = excluded.union(model.aliases_in_class(color, class));
                }
            }

            let cursor = if self.config.min_caller_saved {
                None
            } else {
                Some(&mut self.caller_cursor)
            };
            let color = model
                .choose(class, model.caller_saved(), excluded, cursor)
                .or_else(|| model.choose(class, model.callee_saved(), excluded, None));

            match color {
                Some(color) => {
                    self.colored.push(&mut self.nodes, n);
                    self.nodes[n].color = Some(color);
                    trace!("n{} ({}) -> {}", n, self.nodes[n].opnd, model.reg_name(color));
                }
                None => {
                    self.spilled.push(&mut self.nodes, n);
                    trace!("n{} ({}) spilled", n, self.nodes[n].opnd);
                }
            }
        }

        if self.spilled.is_empty() {
            self.propagate_alias_colors();
        }
    }

    /// Give each coalesced node the color of the node it was merged into
    pub(super) fn propagate_alias_colors(&mut self) {
        while let Some(n) = self.coalesced.pop(&mut self.nodes) {
            let a = self.get_alias(n);
            if matches!(
                self.nodes[a].state,
                NodeState::Colored | NodeState::Precolored
            ) {
                self.nodes[n].color = self.nodes[a].color;
                self.colored.push(&mut self.nodes, n);
            }
        }
    }
}
