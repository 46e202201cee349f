//! Demand-driven pool capacity with hysteresis.
//!
//! Growth and shrink are both debounced so a single spiky cycle cannot force
//! a reallocation: the pool grows to `headroom x demand` only after the
//! demand has exceeded the current target for a run of cycles, and decays a
//! small percentage per cycle only after a much longer run of quiet cycles.

/// Hysteresis state for one elastic pool
pub struct PoolSizeManager {
    min_size: u32,
    max_size: u32,
    grow_headroom: f32,
    grow_debounce: u32,
    shrink_decay: f32,
    shrink_debounce: u32,
    target: u32,
    over_budget_cycles: u32,
    under_budget_cycles: u32,
    grow_count: u64,
    shrink_count: u64,
}

impl PoolSizeManager {
    pub fn new(
        initial: u32,
        min_size: u32,
        max_size: u32,
        grow_headroom: f32,
        grow_debounce: u32,
        shrink_decay: f32,
        shrink_debounce: u32,
    ) -> Self {
        debug_assert!(min_size <= initial && initial <= max_size);
        Self {
            min_size,
            max_size,
            grow_headroom,
            grow_debounce,
            shrink_decay,
            shrink_debounce,
            target: initial,
            over_budget_cycles: 0,
            under_budget_cycles: 0,
            grow_count: 0,
            shrink_count: 0,
        }
    }

    /// Feed one cycle's observed demand; returns the current size target
    pub fn update(&mut self, demand: u32) -> u32 {
        if demand > self.target {
            self.under_budget_cycles = 0;
            self.over_budget_cycles += 1;
            if self.over_budget_cycles >= self.grow_debounce {
                let grown = (demand as f32 * self.grow_headroom).ceil() as u32;
                let new_target = grown.clamp(self.min_size, self.max_size);
                if new_target > self.target {
                    log::info!(
                        "[PoolSizeManager] growing target {} -> {} (demand {})",
                        self.target,
                        new_target,
                        demand
                    );
                    self.target = new_target;
                    self.grow_count += 1;
                }
                self.over_budget_cycles = 0;
            }
        } else if demand < self.target {
            self.over_budget_cycles = 0;
            self.under_budget_cycles += 1;
            if self.under_budget_cycles >= self.shrink_debounce {
                let decayed = (self.target as f32 * (1.0 - self.shrink_decay)) as u32;
                let new_target = decayed.max(demand).clamp(self.min_size, self.max_size);
                if new_target < self.target {
                    log::debug!(
                        "[PoolSizeManager] decaying target {} -> {} (demand {})",
                        self.target,
                        new_target,
                        demand
                    );
                    self.target = new_target;
                    self.shrink_count += 1;
                }
            }
        } else {
            self.over_budget_cycles = 0;
            self.under_budget_cycles = 0;
        }
        self.target
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn grow_count(&self) -> u64 {
        self.grow_count
    }

    pub fn shrink_count(&self) -> u64 {
        self.shrink_count
    }
}
