// Randomized checks of the planner's block invariants

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use step_planner::motion::planner::recalculate;
    use step_planner::{
        Axis, AxisArray, Block, BlockFlags, BlockQueue, Config, EnqueueOutcome, Planner,
        SimulatedStepper,
    };

    fn setup(config: &Config) -> (Planner<SimulatedStepper>, Arc<BlockQueue>, SimulatedStepper) {
        let queue = Arc::new(BlockQueue::new(config.planner.block_buffer_size));
        let stepper = SimulatedStepper::new(queue.clone());
        let planner = Planner::new(config, queue.clone(), stepper.clone()).unwrap();
        (planner, queue, stepper)
    }

    fn queued_blocks(queue: &BlockQueue) -> Vec<Block> {
        queue.queued().filter_map(|seq| queue.snapshot(seq)).collect()
    }

    fn random_target(rng: &mut StdRng, from: &AxisArray<f64>) -> AxisArray<f64> {
        AxisArray::new(
            from[Axis::X] + rng.random_range(-20.0..20.0),
            from[Axis::Y] + rng.random_range(-20.0..20.0),
            from[Axis::Z] + if rng.random_bool(0.1) { rng.random_range(-0.5..0.5) } else { 0.0 },
            from[Axis::E] + if rng.random_bool(0.5) { rng.random_range(-1.0..2.0) } else { 0.0 },
        )
    }

    fn assert_block_invariants(block: &Block) {
        let max_steps = block.steps.values().copied().max().unwrap();
        assert_eq!(block.step_event_count, max_steps);
        assert!(block.accelerate_until <= block.decelerate_after, "{:?}", block);
        assert!(block.decelerate_after <= block.step_event_count, "{:?}", block);
        assert!(block.entry_speed <= block.max_entry_speed, "{:?}", block);
        assert!(block.entry_speed >= 0.0);
        assert!(block.max_entry_speed <= block.nominal_speed + 1e-9);
    }

    #[test]
    fn test_block_invariants_hold_while_executing() {
        let mut rng = StdRng::seed_from_u64(7);
        let (mut planner, queue, stepper) = setup(&Config::default());
        {
            let stepper = stepper.clone();
            planner.set_idle_hook(move || {
                stepper.tick(0.005);
            });
        }

        let mut target = AxisArray::splat(0.0);
        let mut queued = 0;
        for _ in 0..300 {
            target = random_target(&mut rng, &target);
            let feed = rng.random_range(5.0..200.0);
            if planner.enqueue(target, feed, 0).unwrap() == EnqueueOutcome::Queued {
                queued += 1;
            }
            for block in queued_blocks(&queue) {
                assert_block_invariants(&block);
            }
            if rng.random_bool(0.3) {
                stepper.tick(rng.random_range(0.0..0.02));
            }
        }
        assert!(queued > 250);

        stepper.run_until_idle(0.01, 1_000_000);
        assert!(queue.is_empty());
        assert_eq!(stepper.position(), planner.position_steps());
    }

    #[test]
    fn test_entry_speeds_are_reachable_from_predecessor() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let (mut planner, queue, _) = setup(&Config::default());
            let mut target = AxisArray::splat(0.0);
            while !queue.is_full() {
                target = random_target(&mut rng, &target);
                planner.enqueue(target, rng.random_range(5.0..200.0), 0).unwrap();
            }

            let blocks = queued_blocks(&queue);
            for pair in blocks.windows(2) {
                let (previous, current) = (&pair[0], &pair[1]);
                let reachable = (previous.entry_speed * previous.entry_speed
                    + 2.0 * previous.acceleration * previous.millimeters)
                    .sqrt();
                assert!(current.entry_speed <= reachable + 1e-9);
            }
            let newest = blocks.last().unwrap();
            assert_eq!(newest.final_rate, 120);
            assert!(blocks.iter().all(|b| !b.flags.contains(BlockFlags::RECALCULATE)));
        }
    }

    #[test]
    fn test_recalculate_is_idempotent_on_planned_queue() {
        let mut rng = StdRng::seed_from_u64(23);
        for _ in 0..20 {
            let (mut planner, queue, _) = setup(&Config::default());
            let mut target = AxisArray::splat(0.0);
            while !queue.is_full() {
                target = random_target(&mut rng, &target);
                planner.enqueue(target, rng.random_range(5.0..200.0), 0).unwrap();
            }

            let before = queued_blocks(&queue);
            recalculate(&queue, 120);
            assert_eq!(before, queued_blocks(&queue));
        }
    }

    #[test]
    fn test_corexy_execution_ends_at_planned_position() {
        let mut config = Config::default();
        config.planner.kinematics = step_planner::motion::KinematicsType::CoreXY;
        let mut rng = StdRng::seed_from_u64(3);
        let (mut planner, queue, stepper) = setup(&config);
        {
            let stepper = stepper.clone();
            planner.set_idle_hook(move || {
                stepper.tick(0.005);
            });
        }

        let mut target = AxisArray::splat(0.0);
        for _ in 0..100 {
            target = random_target(&mut rng, &target);
            planner.enqueue(target, rng.random_range(20.0..150.0), 0).unwrap();
        }
        stepper.run_until_idle(0.01, 1_000_000);
        assert!(queue.is_empty());

        let logical = planner.position_steps();
        let motors = stepper.position();
        assert_eq!(motors[Axis::X], logical[Axis::X] + logical[Axis::Y]);
        assert_eq!(motors[Axis::Y], logical[Axis::X] - logical[Axis::Y]);
        assert_eq!(motors[Axis::Z], logical[Axis::Z]);
    }
}
