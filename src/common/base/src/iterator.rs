#[async_trait]
pub trait AsyncIterator {
    type Item;
    type Error;

    async fn try_next(&mut self) -> Result<Option<Self::Item>, Self::Error>;

    /// try_collect drains the iterator, stopping at the first error.
    async fn try_collect(mut self) -> Result<Vec<Self::Item>, Self::Error>
    where
        Self: Sized + Send,
        Self::Item: Send,
        Self::Error: Send,
    {
        let mut items = Vec::new();
        while let Some(item) = self.try_next().await? {
            items.push(item);
        }
        Ok(items)
    }
}
